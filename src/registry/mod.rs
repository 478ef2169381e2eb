pub mod grants;
pub mod models;
pub mod resolve;
pub mod usage;

pub use grants::{AccessGrant, GrantUpdate, GrantsStore, NewGrant};
pub use models::{Model, ModelParameters, ModelUpdate, ModelsStore, NewModel};
pub use resolve::ModelResolver;
pub use usage::{
    ModelUsageStats, NewUsage, RequestType, UsageFilter, UsageOutcome, UsageRecord, UsageStore,
};
