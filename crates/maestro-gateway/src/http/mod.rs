pub mod chat;
pub mod conversations;
pub mod health;
pub mod ledger;
pub mod sse;
pub mod workflows;
