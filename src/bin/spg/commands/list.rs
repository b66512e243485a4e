use crate::commands::Context;
use crate::output;
use anyhow::Result;
use spg::core::request::{Request, Target};
use spg::remote::RemoteExecutor;

pub fn handle_list<E: RemoteExecutor>(ctx: &Context<E>, target: &Target) -> Result<()> {
    let request = Request::List {
        target: target.clone(),
    };
    let registry = ctx.session.registry();
    let machines = request.validate(registry, ctx.session.invoker())?;

    println!("{}", output::machine_table(&machines));
    println!("{}", output::list_summary(registry, &machines));
    Ok(())
}
