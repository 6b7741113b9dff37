//! `skiff version`: client and server versions.

use anyhow::Result;

use crate::client::SkiffClient;

/// Print the client version, then the server's if it can be reached.
pub async fn version(addr: &str) -> Result<()> {
    println!("Client: v{}", env!("CARGO_PKG_VERSION"));

    match SkiffClient::connect(addr).await {
        Ok(mut client) => match client.version().await {
            Ok(v) if v.git_commit.is_empty() => println!("Server: v{}", v.sem_ver),
            Ok(v) => println!("Server: v{} ({})", v.sem_ver, v.git_commit),
            Err(e) => println!("Server: unreachable ({})", e),
        },
        Err(_) => println!("Server: unreachable"),
    }
    Ok(())
}
