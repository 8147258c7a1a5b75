use anyhow::Result;

fn main() -> Result<()> {
    boxd::cli::run()
}
