pub mod crd;

/// Comma-separated list of canonical label selectors which match the
/// Keel Operator's labelling scheme.
pub const KEEL_OPERATOR_LABEL_SELECTORS: &str = "app=keel,keel.rs/controlled-by=keel-operator";

/// The canonical `app` label value of all objects controlled by Keel.
pub const LABEL_APP_VALUE: &str = "keel";
/// The canonical label identifying the controller of an object.
pub const LABEL_CONTROLLED_BY: &str = "keel.rs/controlled-by";
/// The canonical value of the `keel.rs/controlled-by` label.
pub const LABEL_CONTROLLED_BY_VALUE: &str = "keel-operator";
/// The canonical label identifying the cluster which owns an object.
pub const LABEL_CLUSTER: &str = "keel.rs/cluster";
/// The canonical label identifying the component kind of an object.
pub const LABEL_KIND: &str = "keel.rs/kind";
/// The label prefix reserved for Keel; user labels bearing it are never propagated.
pub const RESERVED_LABEL_PREFIX: &str = "keel.rs/";
