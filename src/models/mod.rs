pub mod site;

pub use site::{BlockMode, BudgetState, ModeKind, NewSite, RemovedRecord, RuleId, SiteId, SitePolicy, DEFAULT_COLOR};
