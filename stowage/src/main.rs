//! stowage - backup CLI entry point.
//!
//! Runs the bootstrap pipeline, dispatches the resolved command, then
//! releases everything the pipeline acquired.

use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use stowage::bootstrap::{BootstrapContext, Pipeline};
use stowage::errors::BootstrapError;
use stowage::reporting::AccountEmitterResolver;
use stowage::task::{dispatch, TaskReporting};
use stowage::utils::{format_duration, sanitize_text, Console};

fn main() {
    let mut argv = std::env::args();
    let program = argv
        .next()
        .as_deref()
        .and_then(|p| Path::new(p).file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "stowage".to_string());
    let args: Vec<String> = argv.collect();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{program}: could not start runtime: {e}");
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(run(program, args));
    drop(runtime);
    std::process::exit(code);
}

async fn run(program: String, args: Vec<String>) -> i32 {
    let mut ctx = BootstrapContext::new(program.as_str(), args);

    let mut status = match Pipeline::standard().run(&mut ctx).await {
        Err(e) => {
            print_error(&ctx.console, &program, &e.to_string(), e.hint());
            e.exit_code()
        }
        Ok(()) if ctx.should_exit() => ctx.exit_code(),
        Ok(()) => execute(&mut ctx, &program).await,
    };

    if let Some(profiler) = ctx.profiler.clone() {
        if ctx.options.time {
            ctx.console.println(format!("time: {}", format_duration(profiler.elapsed())));
        }
        if let Err(e) = profiler.finish() {
            warn!(error = %e, "profiling finalization failed");
        }
    }

    if let Err(e) = ctx.close() {
        print_error(&ctx.console, &program, &format!("cleanup failed: {e}"), None);
        if status == 0 {
            status = 1;
        }
    }
    status
}

async fn execute(ctx: &mut BootstrapContext, program: &str) -> i32 {
    let Some(cookies) = ctx.cookies.clone() else {
        print_error(&ctx.console, program, "cookie store not initialized", None);
        return 1;
    };
    let resolver = AccountEmitterResolver::new(cookies).with_services_endpoint(ctx.services_endpoint.clone());
    let reporting = TaskReporting::new(Arc::new(resolver), ctx.cancel.clone());

    match dispatch(ctx, &reporting).await {
        Ok(status) => status,
        Err(e) => {
            let hint = e.downcast_ref::<BootstrapError>().and_then(BootstrapError::hint);
            print_error(&ctx.console, program, &format!("{e:#}"), hint);
            1
        }
    }
}

fn print_error(console: &Console, program: &str, message: &str, hint: Option<&str>) {
    console.eprintln(format!("{program}: {}", sanitize_text(message)));
    if let Some(hint) = hint {
        console.eprintln(hint);
    }
}
