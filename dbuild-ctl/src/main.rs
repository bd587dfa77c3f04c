mod args;
use args::{parse_args, Commands};

mod core;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let command = parse_args();

    match command {
        Commands::Build {
            address,
            graph,
            sources,
        } => {
            if !crate::core::build(address, &graph, &sources).await? {
                std::process::exit(1);
            }
        }
        Commands::Hash { file } => crate::core::hash(&file).await?,
    }

    Ok(())
}
