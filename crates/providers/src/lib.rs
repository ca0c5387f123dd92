//! Model provider clients for taskforge.
//!
//! Both clients stream: partial text reaches the caller's callback as it
//! arrives and the final response is assembled from the stream. The
//! [`ProviderFactory`] turns a stored provider record into a client.

pub mod anthropic;
pub mod factory;
pub mod openai_compat;
mod sse;

pub use anthropic::AnthropicProvider;
pub use factory::ProviderFactory;
pub use openai_compat::OpenAiCompatProvider;
