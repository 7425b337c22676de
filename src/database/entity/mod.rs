pub mod app_settings;
pub mod rule;

pub mod prelude {
    pub use super::app_settings::Entity as AppSettings;
    pub use super::rule::Entity as Rules;
}
