//! Database side of a scrub run: bulk updates, trimming, and the runner
//! tying them to settings and the model registry.

pub mod errors;
pub mod run;
pub mod trim;
pub mod update;

pub use errors::ScrubError;
pub use run::{CleanupReport, ModelReport, ScrubOptions, ScrubOutcome, ScrubReport, ScrubRunner};
pub use trim::{DeleteOutcome, TrimReport, TrimSettings, TrimWindow, Trimmer, force_delete};
pub use update::{UpdatePlan, UpdateReport, apply_update, build_update, mod_pk_sql, trigger_sql};
