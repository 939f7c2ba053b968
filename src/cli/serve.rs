use anyhow::Result;

use crate::config::Config;
use crate::server::Server;

pub async fn run() -> Result<()> {
    let config = Config::load()?;
    Server::new(&config).run().await
}
