use anyhow::Result;

fn main() -> Result<()> {
    stagehand::cli::run()
}
