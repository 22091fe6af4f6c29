//! TinCan chat server binary
//!
//! ```text
//! tincan-server [--config <path>] [--port <port>] [--bind <addr:port>]
//!               [--max-clients <n>] [--history-lines <n>] [--chat-log <path>]
//!               [--users <path>] [--groups <path>] [--reject-duplicates]
//! ```

use signal_hook::consts::{SIGINT, SIGTERM};

use tincan_server::{Server, ServerConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let config = ServerConfig::from_args(&args)?;

    log::info!("TinCan server starting...");
    log::info!("  Bind:        {}", config.bind_addr);
    log::info!("  Max clients: {}", config.max_clients);
    log::info!("  History:     {} lines", config.history_lines);
    log::info!("  Chat log:    {}", config.chat_log.display());
    log::info!("  Users:       {}", config.allowed_users.display());
    log::info!("  Groups:      {}", config.groups.display());

    // Create server and run
    let mut server = Server::bind(config)?;

    let shutdown = server.shutdown_handle();
    signal_hook::flag::register(SIGINT, shutdown.flag())?;
    signal_hook::flag::register(SIGTERM, shutdown.flag())?;

    server.run()
}
