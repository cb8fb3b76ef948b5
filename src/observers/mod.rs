//! Observation strategies raced by the harness.
//!
//! - `PollingObserver` + `NonceProbe`: nonce at a block tag (`pending`,
//!   `latest`, ..) compared with the baseline nonce
//! - `PollingObserver` + `ReceiptProbe`: receipt availability
//! - `SubscriptionObserver`: first matching `eth_subscription` notification

pub mod poll;
pub mod stream;

pub use poll::{NonceProbe, PollingObserver, Probe, ReceiptProbe, DEFAULT_CADENCE};
pub use stream::{FirstDetection, NotificationMatch, SubscriptionObserver};
