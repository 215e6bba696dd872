//! A counting permit limiter whose capacity can be grown or shrunk at runtime.
//!
//! ```
//! # use capacity_limiter::{Context, Limiter};
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), capacity_limiter::Error> {
//! let ctx = Context::background();
//! let limiter = Limiter::new(&ctx, 8, 2)?;
//!
//! let permit = limiter.acquire(&ctx).await?;
//! limiter.increment()?;
//! assert_eq!(limiter.state().available(), 2);
//!
//! drop(permit);
//! limiter.decrement(&ctx).await?;
//! assert_eq!(limiter.state().current_size(), 2);
//! # Ok(())
//! # }
//! ```

mod context;
mod error;
mod limiter;
mod options;

pub use context::Context;
pub use error::Error;
pub use limiter::{Limiter, LimiterState, Permit};
pub use options::{DecrementMode, LimiterOptions};
pub use tokio_util::sync::CancellationToken;
