//! Cascade specifications, templating, and the explicit registries.

pub mod registry;
pub mod spec;
pub mod template;

pub use registry::{DataTool, Registries, ToolError, ToolKind};
pub use spec::{
    AutoFixSpec, CascadeConfigError, CascadeSpec, CellSpec, HumanInput, HumanInputSpec,
    OutputMode, TimeoutAction, WardCheck, WardMode, WardSpec, WardsSpec,
};
pub use template::{render, scan_refs, TemplateContext, TemplateError};
