use anyhow::Result;

fn main() -> Result<()> {
    atmux::boot::init_logging();
    let matches = atmux::cli::parse_args();
    if let Err(err) = atmux::cli::actions::run(&matches) {
        log::error!("{err:#}");
        return Err(err);
    }
    Ok(())
}
