//! The error taxonomy shared across the crate.
//!
//! Every failure carries a stable name discriminant alongside its display
//! string, so hosts can branch on error identity without string matching.

use thiserror::Error;

use crate::value::Value;

/// Any error raised by collections, transactions, the query builder, the
/// compiler, or the optimizer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // Configuration.
    /// A collection was configured incorrectly.
    #[error("invalid collection config: {0}")]
    InvalidConfig(String),
    /// The configured schema validator rejected a row.
    #[error("schema validation failed: {0}")]
    SchemaValidationFailed(String),
    /// The sync configuration is missing or malformed.
    #[error("invalid sync config: {0}")]
    InvalidSyncConfig(String),

    // Collection state.
    /// An operation was attempted on a collection in the error state.
    #[error("collection {0:?} is in an error state and rejects operations")]
    CollectionInErrorState(String),
    /// A lifecycle transition outside the permitted set was requested.
    #[error("collection {id:?} cannot transition from {from:?} to {to:?}")]
    InvalidStatusTransition {
        /// Collection identity.
        id: String,
        /// Current status.
        from: &'static str,
        /// Requested status.
        to: &'static str,
    },
    /// Internal accounting produced a negative subscriber count.
    #[error("collection {0:?} subscriber count went negative")]
    NegativeSubscriberCount(String),

    // Operations.
    /// The key extractor produced `Undefined` for a row.
    #[error("row has an undefined key")]
    UndefinedKey,
    /// An insert collided with an existing visible row.
    #[error("duplicate key {0}")]
    DuplicateKey(Value),
    /// An update attempted to change the row's key.
    #[error("updates may not change the key (from {from} to {to})")]
    KeyChangeNotAllowed {
        /// Key before the update.
        from: Value,
        /// Key after the update.
        to: Value,
    },
    /// An update or delete referenced a key with no visible row.
    #[error("no row under key {0}")]
    MissingKey(Value),
    /// A direct mutation was attempted without the matching handler.
    #[error("collection has no {0} handler for direct mutations")]
    MissingMutationHandler(&'static str),

    // Transactions.
    /// A transaction was created without a mutation function.
    #[error("transaction requires a mutation function")]
    MissingMutationFn,
    /// A transaction method was called in the wrong state.
    #[error("cannot {action} a transaction in state {state:?}")]
    TransactionWrongState {
        /// What was attempted.
        action: &'static str,
        /// The transaction's state at the time.
        state: &'static str,
    },
    /// The transaction was rolled back before persisting.
    #[error("transaction rolled back")]
    TransactionRolledBack,
    /// `write` was called with no pending sync transaction.
    #[error("no pending sync transaction to write into")]
    NoPendingSyncTransactionWrite,
    /// `commit` was called with no pending sync transaction.
    #[error("no pending sync transaction to commit")]
    NoPendingSyncTransactionCommit,
    /// The pending sync transaction was already committed.
    #[error("sync transaction already committed (attempted {0})")]
    SyncTransactionAlreadyCommitted(&'static str),
    /// The scheduler made a full pass without running a job.
    #[error("scheduler deadlock in context {context}: unresolved dependencies {missing:?}")]
    UnresolvedSchedulerDependency {
        /// The transaction context.
        context: u64,
        /// Dependency ids that never completed.
        missing: Vec<String>,
    },

    // Query builder and compiler.
    /// A query declared more than one root source.
    #[error("query may declare only one root source")]
    OnlyOneSourceAllowed,
    /// A subquery was missing its `from`.
    #[error("subquery must have a from clause")]
    SubQueryMustHaveFrom,
    /// The query has no `from`.
    #[error("query must have a from clause")]
    QueryMustHaveFrom,
    /// The `from` expression is not a collection or subquery reference.
    #[error("unsupported from type")]
    UnsupportedFromType,
    /// `distinct` requires an explicit `select`.
    #[error("distinct requires a select clause")]
    DistinctRequiresSelect,
    /// `having` requires `group_by`.
    #[error("having requires a group by clause")]
    HavingRequiresGroupBy,
    /// `limit`/`offset` require `order_by`.
    #[error("limit and offset require an order by clause")]
    LimitOffsetRequireOrderBy,
    /// No input stream was registered for an alias.
    #[error("no collection input found for alias {0:?}")]
    CollectionInputNotFound(String),
    /// An expression variant appeared somewhere it is not understood.
    #[error("unknown expression in {0}")]
    UnknownExpression(&'static str),
    /// A function name outside the supported set.
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
    /// A `Ref` with no path elements.
    #[error("reference path may not be empty")]
    EmptyReferencePath,
    /// A `having` aggregate has no counterpart in the select clause.
    #[error("aggregate in having must also appear in select")]
    AggregateNotInSelect,
    /// A `having` clause the compiler cannot interpret.
    #[error("unknown having expression")]
    UnknownHavingExpression,

    // Joins.
    /// A join type outside inner/left/right/full.
    #[error("unsupported join type {0:?}")]
    UnsupportedJoinType(String),
    /// A join condition that is not a single equality.
    #[error("join condition must be an equality")]
    JoinConditionMustBeEquality,
    /// Both sides of the join condition address the same source.
    #[error("join condition references the same source on both sides")]
    JoinConditionSameSource,
    /// A join condition side references no known alias.
    #[error("join condition side does not reference a joined source")]
    JoinConditionSourceMismatch,
    /// The joined side's input is not available yet.
    #[error("join {0} source is not available")]
    JoinSourceUnavailable(&'static str),
    /// A join source expression that is not a collection or subquery.
    #[error("unsupported join source")]
    UnsupportedJoinSource,

    // Optimizer and internals.
    /// `and`/`or` recombination was handed an empty clause list.
    #[error("cannot combine an empty clause list")]
    CannotCombineEmptyList,
    /// A pushed-down where clause could not be converted to a source filter.
    #[error("where clause conversion failed")]
    WhereClauseConversionFailed,
    /// Alias remapping named a subscription that does not exist.
    #[error("subscription not found for alias {0:?} after remapping")]
    SubscriptionNotFound(String),
    /// `set_window` was invoked on a query with no order by.
    #[error("set_window requires an ordered query")]
    SetWindowRequiresOrderBy,
}

impl Error {
    /// The stable name discriminant for this error.
    pub fn name(&self) -> &'static str {
        match self {
            Error::InvalidConfig(_) => "InvalidConfigError",
            Error::SchemaValidationFailed(_) => "SchemaValidationError",
            Error::InvalidSyncConfig(_) => "InvalidSyncConfigError",
            Error::CollectionInErrorState(_) => "CollectionInErrorStateError",
            Error::InvalidStatusTransition { .. } => "InvalidCollectionStatusTransitionError",
            Error::NegativeSubscriberCount(_) => "NegativeActiveSubscribersError",
            Error::UndefinedKey => "UndefinedKeyError",
            Error::DuplicateKey(_) => "DuplicateKeyError",
            Error::KeyChangeNotAllowed { .. } => "KeyUpdateNotAllowedError",
            Error::MissingKey(_) => "MissingKeyError",
            Error::MissingMutationHandler(_) => "MissingMutationHandlerError",
            Error::MissingMutationFn => "MissingMutationFunctionError",
            Error::TransactionWrongState { .. } => "TransactionWrongStateError",
            Error::TransactionRolledBack => "TransactionRolledBackError",
            Error::NoPendingSyncTransactionWrite => "NoPendingSyncTransactionWriteError",
            Error::NoPendingSyncTransactionCommit => "NoPendingSyncTransactionCommitError",
            Error::SyncTransactionAlreadyCommitted(_) => "SyncTransactionAlreadyCommittedError",
            Error::UnresolvedSchedulerDependency { .. } => "UnresolvedSchedulerDependencyError",
            Error::OnlyOneSourceAllowed => "OnlyOneSourceAllowedError",
            Error::SubQueryMustHaveFrom => "SubQueryMustHaveFromError",
            Error::QueryMustHaveFrom => "QueryMustHaveFromError",
            Error::UnsupportedFromType => "UnsupportedFromTypeError",
            Error::DistinctRequiresSelect => "DistinctRequiresSelectError",
            Error::HavingRequiresGroupBy => "HavingRequiresGroupByError",
            Error::LimitOffsetRequireOrderBy => "LimitOffsetRequireOrderByError",
            Error::CollectionInputNotFound(_) => "CollectionInputNotFoundError",
            Error::UnknownExpression(_) => "UnknownExpressionError",
            Error::UnknownFunction(_) => "UnknownFunctionError",
            Error::EmptyReferencePath => "EmptyReferencePathError",
            Error::AggregateNotInSelect => "AggregateNotInSelectError",
            Error::UnknownHavingExpression => "UnknownHavingExpressionError",
            Error::UnsupportedJoinType(_) => "UnsupportedJoinTypeError",
            Error::JoinConditionMustBeEquality => "JoinConditionMustBeEqualityError",
            Error::JoinConditionSameSource => "JoinConditionSameSourceError",
            Error::JoinConditionSourceMismatch => "JoinConditionSourceMismatchError",
            Error::JoinSourceUnavailable(_) => "JoinSourceUnavailableError",
            Error::UnsupportedJoinSource => "UnsupportedJoinSourceError",
            Error::CannotCombineEmptyList => "CannotCombineEmptyListError",
            Error::WhereClauseConversionFailed => "WhereClauseConversionError",
            Error::SubscriptionNotFound(_) => "SubscriptionNotFoundError",
            Error::SetWindowRequiresOrderBy => "SetWindowRequiresOrderByError",
        }
    }
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
