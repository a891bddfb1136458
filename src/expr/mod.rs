//! Expression and template evaluation.
//!
//! Implements the closed grammar used by branch conditions, while loops and
//! config templates: a dot/bracket JSONPath subset, binary comparisons
//! against literals, truthiness of bare paths, and `{{ … }}` template
//! rendering. Host-implemented and side-effect-free so branch semantics stay
//! auditable; block code cannot override it.

mod eval;
mod path;
mod template;

pub use eval::{evaluate, evaluate_bool, is_truthy, Expr};
pub use path::get_path;
pub use template::{expand_templates, render_template};
