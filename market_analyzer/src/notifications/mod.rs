pub mod commands;
pub mod formatter;
pub mod telegram;

pub use commands::{parse_command, BotCommand, CommandListener};
pub use telegram::{truncate_message, TelegramNotifier};
