fn main() -> anyhow::Result<()> {
    study_coord_cli::run_cli()
}
