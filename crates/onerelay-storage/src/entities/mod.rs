pub mod abilities;
pub mod channels;
pub mod global_config;
pub mod logs;
pub mod tokens;
pub mod top_ups;
pub mod users;

pub use abilities::Entity as Abilities;
pub use channels::Entity as Channels;
pub use global_config::Entity as GlobalConfig;
pub use logs::Entity as Logs;
pub use tokens::Entity as Tokens;
pub use top_ups::Entity as TopUps;
pub use users::Entity as Users;
