//! Typed dispatch for agents with a fixed set of actions
//!
//! A role lists its actions as an enum. Inbound action strings are parsed
//! once at the boundary into [`Dispatch`], so the role's handler matches an
//! enum exhaustively instead of comparing strings.
//!
//! ```
//! use agent_runtime::{Dispatch, RoleActions};
//!
//! #[derive(Debug, Clone, Copy, PartialEq)]
//! enum ScorerAction {
//!     Score,
//!     Explain,
//! }
//!
//! impl RoleActions for ScorerAction {
//!     const ALL: &'static [Self] = &[Self::Score, Self::Explain];
//!
//!     fn name(&self) -> &'static str {
//!         match self {
//!             Self::Score => "score",
//!             Self::Explain => "explain",
//!         }
//!     }
//! }
//!
//! assert_eq!(ScorerAction::parse("score"), Dispatch::Known(ScorerAction::Score));
//! assert_eq!(ScorerAction::parse("rank"), Dispatch::Unknown("rank".to_string()));
//! ```

use agent_comms::Message;
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::{handler::MessageHandler, Agent, Result, RuntimeError};

/// Closed set of actions served by one agent role
pub trait RoleActions: Copy + Send + Sync + 'static {
    /// Every action of the role
    const ALL: &'static [Self];

    /// Wire name of the action
    fn name(&self) -> &'static str;

    fn parse(action: &str) -> Dispatch<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|known| known.name() == action)
            .map(Dispatch::Known)
            .unwrap_or_else(|| Dispatch::Unknown(action.to_string()))
    }
}

/// Result of parsing an inbound action string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch<A> {
    Known(A),
    /// Not part of the role; kept for open extension at process boundaries
    Unknown(String),
}

/// Handler for every action of a role
#[async_trait]
pub trait RoleHandler<A: RoleActions>: Send + Sync + 'static {
    async fn handle(&self, agent: &Agent, action: A, message: Message) -> Result<()>;
}

/// Bridges a role handler into the string-keyed handler table
pub(crate) struct RoleDispatcher<A, H> {
    role: Arc<H>,
    _actions: PhantomData<fn() -> A>,
}

impl<A, H> RoleDispatcher<A, H> {
    pub(crate) fn new(role: Arc<H>) -> Self {
        Self {
            role,
            _actions: PhantomData,
        }
    }
}

#[async_trait]
impl<A, H> MessageHandler for RoleDispatcher<A, H>
where
    A: RoleActions,
    H: RoleHandler<A>,
{
    async fn handle(&self, agent: &Agent, message: Message) -> Result<()> {
        match A::parse(&message.action) {
            Dispatch::Known(action) => self.role.handle(agent, action, message).await,
            Dispatch::Unknown(action) => Err(RuntimeError::handler(format!(
                "action '{}' is not served by this role",
                action
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum ParserAction {
        ParseCv,
        ParseJob,
    }

    impl RoleActions for ParserAction {
        const ALL: &'static [Self] = &[Self::ParseCv, Self::ParseJob];

        fn name(&self) -> &'static str {
            match self {
                Self::ParseCv => "parse_cv",
                Self::ParseJob => "parse_job",
            }
        }
    }

    #[test]
    fn test_parse_known_and_unknown() {
        assert_eq!(ParserAction::parse("parse_job"), Dispatch::Known(ParserAction::ParseJob));
        assert_eq!(
            ParserAction::parse("parse_pdf"),
            Dispatch::Unknown("parse_pdf".to_string())
        );
    }

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<_> = ParserAction::ALL.iter().map(|a| a.name()).collect();
        names.dedup();
        assert_eq!(names.len(), ParserAction::ALL.len());
    }
}
