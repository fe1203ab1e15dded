pub mod account;
pub mod agent;
pub mod command;
pub mod media;
pub mod module;
pub mod registration;
pub mod registry;
pub mod resolver;
pub mod rsip_stack;
pub mod stack;
pub mod stun;
#[cfg(test)]
pub(crate) mod tests;

pub use account::{Account, AccountError, AnswerMode, DecodeError, DecodeReport, DecodedAccount};
pub use agent::{AgentHandle, AgentId, SpawnError};
pub use command::{CallCommand, CallId, CallRef, CommandQueue, Lifecycle, OwnerRef};
pub use module::SipModule;
pub use registration::RegisterOption;
pub use stack::{MediaFlags, SipStack, StackContext, TransportMask, UaEvent, UaSession};
