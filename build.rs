use anyhow::Result;
use vergen_gix::{BuildBuilder, Emitter, GixBuilder};

// Stamps the binary with the build date and commit shown by `spg --version`.
fn main() -> Result<()> {
    let build = BuildBuilder::default().build_date(true).build()?;
    let gix = GixBuilder::default().sha(true).build()?;

    Emitter::default()
        .add_instructions(&build)?
        .add_instructions(&gix)?
        .emit()?;
    Ok(())
}
