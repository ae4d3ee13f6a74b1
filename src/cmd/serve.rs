//! Status API server: `anvil serve`.

use anyhow::Result;
use std::path::Path;

use anvil::app::Anvil;
use anvil::config::AnvilConfig;

pub async fn cmd_serve(project_dir: &Path, port: u16) -> Result<()> {
    let anvil = Anvil::open(AnvilConfig::new(project_dir.to_path_buf())?)?;
    anvil::api::serve(anvil.api_state(), port).await
}
