use crate::commands::Context;
use crate::output;
use anyhow::Result;
use spg::core::request::Request;
use spg::remote::RemoteExecutor;

pub async fn handle_job<E: RemoteExecutor>(ctx: &Context<E>, request: &Request) -> Result<()> {
    let mut progress = output::progress(ctx.silent);
    let (mut reports, mut jobs) = ctx.session.find_jobs(request, progress.as_mut()).await?;
    output::prepare(&mut reports);
    output::sort_jobs(&mut jobs, &reports);

    if jobs.is_empty() {
        println!("No running jobs found");
    } else {
        println!("{}", output::job_table(&jobs));
    }
    println!(
        "{}",
        output::job_summary(ctx.session.registry(), &reports, &jobs)
    );
    Ok(())
}
