//! Account linking outcomes.
//!
//! Linking an account is a multi-outcome flow, not a call that succeeds or
//! throws: the platform may want a login code, a two-factor password, an
//! OAuth consent round or an interactively captured token before a session
//! exists. Those are expected outcomes and are modeled as variants of
//! [`LinkOutcome`], never as errors.

use serde::Serialize;
use serde_json::Value;

use crate::client::{Capabilities, ClientError, Identity, ProtocolClient};
use crate::session::SessionRecord;

/// One step of an interactive linking flow presented to the operator.
#[derive(Debug, Clone, Serialize)]
pub struct FlowStep {
    /// Machine-readable step action, e.g. `open_webview`.
    pub action: String,
    /// URL to open, when the step has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Operator-facing note.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// An interactive flow the caller must drive to obtain credentials.
#[derive(Debug, Clone, Serialize)]
pub struct InteractiveFlow {
    /// Flow family, e.g. `embedded_browser_capture`.
    pub kind: String,
    /// Ordered steps.
    pub steps: Vec<FlowStep>,
}

/// Everything returned alongside a successful link.
#[derive(Debug, Serialize)]
pub struct LinkedSnapshot {
    /// The authenticated principal.
    pub identity: Identity,
    /// The persisted session record.
    pub session: SessionRecord,
    /// Feature flags for the connected client.
    pub capabilities: Capabilities,
    /// Member snapshot, fully paginated.
    pub members: Vec<Value>,
    /// Conversation snapshot, fully paginated.
    pub conversations: Vec<Value>,
}

/// Result of a `link_account` request.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LinkOutcome {
    /// The account is linked and the client is live.
    Linked(Box<LinkedSnapshot>),

    /// The platform sent a login code out of band; the caller must submit
    /// it.
    CodeRequired {
        /// Why the code is needed.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// The account has two-factor auth; the caller must submit the
    /// password.
    PasswordRequired {
        /// Why the password is needed.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// The platform requires an OAuth consent round.
    ConsentRequired {
        /// Why consent is needed.
        reason: String,
        /// The flow the caller must drive.
        flow: InteractiveFlow,
    },

    /// No token could be resolved; the caller must capture one
    /// interactively.
    TokenRequired {
        /// Why a token is needed.
        reason: String,
        /// The flow the caller must drive.
        flow: InteractiveFlow,
    },

    /// The platform rejected the credentials.
    AuthFailed {
        /// Structured reason, never a raw error dump.
        reason: String,
    },
}

impl LinkOutcome {
    /// Build the `linked` outcome for a freshly connected client: identity,
    /// capabilities and the member/conversation snapshots, fanned out over
    /// the client's listing operations.
    ///
    /// # Errors
    ///
    /// Propagates client failures; a [`ClientError::AuthenticationFailed`]
    /// from any step should be mapped to [`LinkOutcome::AuthFailed`] by the
    /// caller.
    pub async fn linked(
        client: &dyn ProtocolClient,
        session: SessionRecord,
    ) -> Result<Self, ClientError> {
        let identity = client.fetch_identity().await?;
        let capabilities = client.describe_capabilities().await;
        let members = client.list_members().await?;
        let conversations = client.list_conversations().await?;

        Ok(Self::Linked(Box::new(LinkedSnapshot {
            identity,
            session,
            capabilities,
            members,
            conversations,
        })))
    }
}
