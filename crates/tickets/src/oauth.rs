//! OAuth authorization codes, access tokens and refresh tokens.
//!
//! All three are tickets chained to the ticket-granting ticket of the
//! authenticated session, so revoking the session revokes every token
//! minted from it. Authorization codes are single-use with the same
//! at-most-once guarantee as service tickets.

use std::{collections::BTreeSet, sync::Arc};

use crate::{
    catalog::TicketCatalog,
    clock::Clock,
    config::OAuthConfig,
    error::{TicketError, TicketResult},
    registry::{TicketRegistry, create_ticket},
    ticket::{Principal, Service, Ticket, TicketId, TicketKind, TicketPayload},
};

/// Scope that entitles the client to a refresh token.
pub const OFFLINE_ACCESS_SCOPE: &str = "offline_access";

/// Tokens returned by a code exchange or refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenResponse {
    /// The new access token.
    pub access_token: Ticket,
    /// A refresh token, when one was issued (or rotated).
    pub refresh_token: Option<Ticket>,
}

/// Mints and exchanges OAuth tickets.
#[derive(Debug)]
pub struct OAuthTokenFactory {
    registry: Arc<dyn TicketRegistry>,
    catalog: Arc<TicketCatalog>,
    clock: Arc<dyn Clock>,
    config: OAuthConfig,
    max_id_attempts: u32,
}

#[bon::bon]
impl OAuthTokenFactory {
    /// Assembles the factory.
    #[builder]
    pub fn new(
        registry: Arc<dyn TicketRegistry>,
        catalog: Arc<TicketCatalog>,
        clock: Arc<dyn Clock>,
        #[builder(default)] config: OAuthConfig,
        #[builder(default = 3)] max_id_attempts: u32,
    ) -> Self {
        Self { registry, catalog, clock, config, max_id_attempts }
    }

    async fn mint(
        &self,
        kind: TicketKind,
        principal: &Principal,
        payload: TicketPayload,
        parent: &TicketId,
    ) -> TicketResult<Ticket> {
        let definition = self.catalog.find(kind)?;
        let now = self.clock.now();
        create_ticket(self.registry.as_ref(), definition, self.max_id_attempts, |id, policy| {
            Ticket::new(id, principal.clone(), payload.clone(), policy, Some(parent.clone()), now)
        })
        .await
    }

    /// Mints an authorization code for `service` from a live TGT.
    ///
    /// # Errors
    ///
    /// The errors of [`TicketRegistry::get_ticket`] for the TGT, and
    /// [`TicketError::ThrottledReplay`] if the TGT's policy throttles.
    #[tracing::instrument(skip_all, fields(tgt_id = %tgt_id, service = %service))]
    pub async fn issue_code(
        &self,
        tgt_id: &TicketId,
        service: &Service,
        scopes: BTreeSet<String>,
    ) -> TicketResult<Ticket> {
        let tgt = self.registry.touch_ticket(tgt_id, TicketKind::TicketGrantingTicket).await?;

        let payload = TicketPayload::OAuthCode { service: service.clone(), scopes };
        self.mint(TicketKind::OAuthCode, tgt.principal(), payload, tgt_id).await
    }

    /// Exchanges an authorization code for tokens. The code is consumed
    /// whether or not the exchange succeeds.
    ///
    /// # Errors
    ///
    /// - [`TicketError::AlreadyConsumed`] if the code was already exchanged
    /// - [`TicketError::NotFound`] / [`TicketError::Expired`] per the registry
    /// - [`TicketError::AuthorizationDenied`] if presented by another client
    #[tracing::instrument(skip_all, fields(code = %code_id, service = %service))]
    pub async fn exchange_code(
        &self,
        code_id: &TicketId,
        service: &Service,
    ) -> TicketResult<TokenResponse> {
        let code = self.registry.consume_ticket(code_id, TicketKind::OAuthCode).await?;
        if code.service() != Some(service) {
            return Err(TicketError::authorization_denied(format!(
                "code was not issued to {service}"
            )));
        }
        let (Some(tgt_id), Some(scopes)) = (code.parent_id(), code.payload().scopes()) else {
            return Err(TicketError::authorization_denied("code is not bound to a session"));
        };

        let access_token = self
            .mint(
                TicketKind::AccessToken,
                code.principal(),
                TicketPayload::AccessToken { service: service.clone(), scopes: scopes.clone() },
                tgt_id,
            )
            .await?;

        let refresh_token =
            if self.config.issue_refresh_tokens && scopes.contains(OFFLINE_ACCESS_SCOPE) {
                Some(
                    self.mint(
                        TicketKind::RefreshToken,
                        code.principal(),
                        TicketPayload::RefreshToken {
                            service: service.clone(),
                            scopes: scopes.clone(),
                        },
                        tgt_id,
                    )
                    .await?,
                )
            } else {
                None
            };

        tracing::info!(
            audit.action = "exchange_code",
            audit.resource = %code_id,
            audit.result = "success",
            access_token = %access_token.id(),
            refresh = refresh_token.is_some(),
            "audit_event"
        );
        Ok(TokenResponse { access_token, refresh_token })
    }

    /// Issues a new access token from a refresh token. With rotation
    /// enabled the refresh token is consumed and replaced.
    ///
    /// # Errors
    ///
    /// - [`TicketError::NotFound`] / [`TicketError::Expired`] per the registry
    /// - [`TicketError::AlreadyConsumed`] for a rotated-out refresh token
    /// - [`TicketError::AuthorizationDenied`] if presented by another client
    #[tracing::instrument(skip_all, fields(refresh_token = %refresh_id, service = %service))]
    pub async fn refresh_access_token(
        &self,
        refresh_id: &TicketId,
        service: &Service,
    ) -> TicketResult<TokenResponse> {
        let refresh = if self.config.rotate_refresh_tokens {
            self.registry.consume_ticket(refresh_id, TicketKind::RefreshToken).await?
        } else {
            self.registry.touch_ticket(refresh_id, TicketKind::RefreshToken).await?
        };

        if refresh.service() != Some(service) {
            return Err(TicketError::authorization_denied(format!(
                "refresh token was not issued to {service}"
            )));
        }
        let (Some(tgt_id), Some(scopes)) = (refresh.parent_id(), refresh.payload().scopes()) else {
            return Err(TicketError::authorization_denied(
                "refresh token is not bound to a session",
            ));
        };

        let access_token = self
            .mint(
                TicketKind::AccessToken,
                refresh.principal(),
                TicketPayload::AccessToken { service: service.clone(), scopes: scopes.clone() },
                tgt_id,
            )
            .await?;

        let refresh_token = if self.config.rotate_refresh_tokens {
            Some(
                self.mint(
                    TicketKind::RefreshToken,
                    refresh.principal(),
                    TicketPayload::RefreshToken {
                        service: service.clone(),
                        scopes: scopes.clone(),
                    },
                    tgt_id,
                )
                .await?,
            )
        } else {
            None
        };

        Ok(TokenResponse { access_token, refresh_token })
    }
}
