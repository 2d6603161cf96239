pub mod admin;
pub mod telegram_auth;

pub use admin::AdminToken;
pub use telegram_auth::TelegramUser;
