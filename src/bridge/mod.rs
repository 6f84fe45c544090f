//! SQL UDF bridge: cascade calls embedded inside user SQL, plus the
//! `THEN <STAGE> ... INTO <table>` pipeline.

pub mod pipeline;
pub mod safety;
pub mod structure;
pub mod udf;

pub use pipeline::{parse_pipeline, PipelineError, PipelineStage};
pub use safety::{strip_code_fences, validate_sql_safety, SqlSafetyError};
pub use structure::{extract_structure, make_cache_key, structure_hash};
pub use udf::{BridgeError, SqlBridge, UdfCall};
