pub mod engine;
pub mod plan;

pub use engine::{
    EstimateReport, LayoutError, MigrateOptions, MigrateReport, MigrationEngine, SymbolAction,
    SymbolOutcome, VerifyReport,
};
pub use plan::{load_plan, save_plan, IntervalPlan, MigrationPlan, PlanStatus, VenuePlan};
