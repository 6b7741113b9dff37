//! `skiff logs`: print persisted logs for one build.

use anyhow::Result;

use crate::client::SkiffClient;

pub async fn logs(client: &mut SkiffClient, app_name: &str, build_id: &str, limit: i64) -> Result<()> {
    let response = client.get_logs(app_name, build_id, limit).await?;
    print!("{}", String::from_utf8_lossy(&response.content));
    Ok(())
}
