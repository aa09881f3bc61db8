fn main() -> anyhow::Result<()> {
    arbor::cli::run_cli()
}
