//! LLM provider adapters.
//!
//! The engine talks to models through [`LlmProvider`]; adapters translate
//! between Spool's internal types and each provider's wire format. Credential
//! choice happens upstream (the key arbiter), so adapters are constructed
//! per request from a resolved key + endpoint.

mod openai_compat;
pub mod retry;
mod sse;
mod traits;

pub use openai_compat::OpenAiCompatProvider;
pub use traits::{ChatRequest, ChatResponse, LlmProvider};
