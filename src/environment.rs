use strum::{Display, EnumString};

/// Deployment environment, selected through `COURIER_ENVIRONMENT`.
///
/// Picks which `config/{environment}.toml` file is loaded at startup;
/// development is assumed when the variable is unset or unrecognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Production,
    Test,
}
