//! Core traits for the rangesync system
//!
//! This module defines the abstract interfaces of the pipeline's external
//! collaborators.
//!
//! - [`RangeFeed`]: Fetch the authoritative range document
//! - [`RangeStore`]: Durable keyed table of range records
//! - [`SecurityBoundary`]: Live rule set converged by the reconciler

pub mod range_feed;
pub mod range_store;
pub mod security_boundary;

pub use range_feed::{ChangeNotification, FeedEntry, RangeDocument, RangeFeed, RangeFeedFactory};
pub use range_store::{RangeStore, RangeStoreFactory};
pub use security_boundary::{
    ApplyOutcome, BoundaryRule, SecurityBoundary, SecurityBoundaryFactory, managed_tag,
};
