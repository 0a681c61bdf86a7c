//! Rill is a client-side reactive data layer: collections of rows kept in
//! sync with an authoritative source, optimistic local mutations layered on
//! top, and live queries maintained incrementally as the data changes.
//!
//! Collections hold a synced base fed by a sync adapter and an optimistic
//! overlay contributed by in-flight transactions; reads always see the
//! composition of the two. Queries are written against a relational
//! representation (select, where, join, group by, order by, limit) and
//! compiled into a push-driven multiset dataflow graph whose inputs are
//! collection change streams and whose output is another collection, so
//! query results nest and compose.
//!
//! # Examples
//!
//! ```ignore
//! use rill::{live_query, object, Collection, CollectionConfig, SyncConfig};
//! use rill::expr::{dsl::*, Query};
//!
//! // A collection keyed by its rows' `id` field, fed by a sync adapter.
//! let users = Collection::new(CollectionConfig::new(
//!     |row| row.field("id").clone(),
//!     SyncConfig::new(|ctx| {
//!         ctx.begin();
//!         ctx.write(rill::SyncWrite::insert(object![("id", 1), ("age", 33)]))?;
//!         ctx.commit()?;
//!         ctx.mark_ready();
//!         Ok(Default::default())
//!     }),
//! ))?;
//!
//! // A live query over it: adults, incrementally maintained.
//! let adults = live_query(&Query {
//!     from: Some(users.as_source("u")),
//!     where_clauses: vec![gte(col("u.age"), rill::expr::Expr::val(18))],
//!     ..Query::default()
//! })?;
//! adults.preload()?;
//! assert_eq!(adults.rows().len(), 1);
//! ```

#![forbid(missing_docs)]

pub mod collection;
pub mod compile;
pub mod consolidation;
pub mod dataflow;
pub mod difference;
pub mod draft;
pub mod errors;
pub mod expr;
pub mod fractional;
pub mod index;
pub mod live;
pub mod multiset;
pub mod optimize;
pub mod subscription;
pub mod transactions;
pub mod tree;
pub mod value;

pub use collection::{
    ChangeEvent, Collection, CollectionConfig, CollectionStatus, EventKind, SyncConfig,
    SyncContext, SyncHandle, SyncWrite,
};
pub use draft::ChangeDraft;
pub use errors::{Error, Result};
pub use expr::{Expr, Query};
pub use live::{live_query, LiveQuery};
pub use multiset::{Delta, MultiSet};
pub use subscription::{SubscribeOptions, Subscription};
pub use transactions::{Transaction, TransactionConfig};
pub use value::{Key, Value};
