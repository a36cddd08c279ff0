pub mod echo;
pub mod info;
pub mod ping;

pub use echo::{EchoArgs, run_echo};
pub use info::show_info;
pub use ping::{PingArgs, run_ping};
