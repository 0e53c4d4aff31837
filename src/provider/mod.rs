pub mod mock;
pub mod traits;

pub use mock::{MockProvider, MockResponse, MockToolCall};
pub use traits::*;
