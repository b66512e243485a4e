use crate::commands::Context;
use crate::output;
use anyhow::Result;
use spg::core::request::Request;
use spg::remote::RemoteExecutor;

pub async fn handle_user<E: RemoteExecutor>(ctx: &Context<E>, request: &Request) -> Result<()> {
    let mut progress = output::progress(ctx.silent);
    let mut reports = ctx.session.scan(request, progress.as_mut()).await?;
    output::prepare(&mut reports);

    let summaries = output::summaries(ctx.session.registry(), &reports);
    println!("{}", output::user_table(&summaries));
    Ok(())
}
