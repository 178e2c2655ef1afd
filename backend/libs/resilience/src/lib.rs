/// Resilience patterns for the ranking engine
///
/// - **Dispatcher**: bounded in-flight slots with a FIFO wait queue, rejecting with `Overloaded`
/// - **Timeout**: deadline and cancellation wrappers for store calls
///
/// # Example: guarding a request
///
/// ```rust,no_run
/// use resilience::{Dispatcher, DispatcherConfig};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let dispatcher = Dispatcher::new(DispatcherConfig::default());
///     let cancel = CancellationToken::new();
///
///     let result = dispatcher.run(&cancel, async {
///         // rank the request here
///     }).await;
/// }
/// ```

pub mod dispatcher;
pub mod timeout;

pub use dispatcher::{DispatchError, Dispatcher, DispatcherConfig, DispatcherStats, Permit};
pub use timeout::{with_cancel, with_timeout, TimeoutError};
