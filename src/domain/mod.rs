//! Domain types shared across the controller.

mod credential;
mod plugin;
mod report;

pub use credential::GitCredential;
pub use plugin::{
    slugify, AdditionalField, DeploymentStatus, EnvVar, EnvVarKind, PluginType, PluginVersion,
    RegistrationType, ResourceBudget, ScanChecks, Source, Version, IMAGE_FIELD_LABEL,
    RUN_FIELD_LABEL, SECRET_MASK,
};
pub use report::{ScanReport, SastFinding, VulnFinding};
