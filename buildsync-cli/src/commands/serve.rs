use anyhow::Result;
use buildsync_core::Repository;
use buildsync_server::BuildsyncServer;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;

pub async fn run(port: u16, repos: Vec<PathBuf>, dir: Option<PathBuf>) -> Result<()> {
    let workspace = super::Workspace::open_or_init(dir)?;

    println!("{}", "🚀 Starting buildsync server...".bold().cyan());
    println!("   {}: {:?}", "Database".bold(), workspace.db_path());

    let mut server = BuildsyncServer::new(workspace.db_path(), workspace.config.clone())?;
    for path in &repos {
        let repo = super::open_repository(path, None, &workspace.config.sync)?;
        println!("   {}: {} ({:?})", "Repository".bold(), repo.id(), path);
        server = server.with_repository(Arc::new(repo));
    }

    println!(
        "   {}: {}",
        "API Server".bold(),
        format!("http://localhost:{}", port).green()
    );
    println!();
    println!("{}", "Press Ctrl+C to stop".dimmed());
    println!();

    let addr = format!("0.0.0.0:{}", port).parse()?;
    server.serve(addr).await?;

    Ok(())
}
