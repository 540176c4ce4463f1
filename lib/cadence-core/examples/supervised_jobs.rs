//! Runs a handful of flaky jobs under supervisors, in one scope, reporting progress over a broadcast channel.
//!
//! Some jobs hand their work off to a background thread and wait for it through a completer.
//!
//! ```text
//! CADENCE_LOG_LEVEL=debug CADENCE_SUPERVISOR__MAX_ATTEMPTS=4 cargo run -p cadence-core --example supervised_jobs
//! ```
use std::{cell::Cell, rc::Rc, thread, time::Duration};

use cadence_app::logging::{fatal_and_exit, initialize_logging};
use cadence_core::{
    config::RuntimeConfiguration, sleep, Broker, ErrorKind, GroupHandler, Handle, Scheduler, Supervisor, TaskError,
};
use cadence_error::generic_error;
use tracing::{info, level_filters::LevelFilter, warn};

const FLAKY: ErrorKind = ErrorKind::new("FlakyJob");

fn flaky_job(handle: Handle, progress: Broker<String>, job: u32) -> Supervisor<impl FnMut() -> JobFuture> {
    let attempts = Rc::new(Cell::new(0u32));

    Supervisor::new(move || -> JobFuture {
        let handle = handle.clone();
        let progress = progress.clone();
        attempts.set(attempts.get() + 1);
        let attempt = attempts.get();

        Box::pin(async move {
            // Job `n` fails on its first `n` attempts.
            if attempt <= job {
                sleep(Duration::from_millis(5)).await?;
                return Err(TaskError::application(
                    FLAKY,
                    generic_error!("job {} failed on attempt {}", job, attempt),
                ));
            }

            let (result, completer) = handle.completion::<u64>();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                completer.resolve(u64::from(job) * 1000);
            });

            let value = result.wait().await?;
            progress.publish("progress", format!("job {} finished after {} attempts", job, attempt));
            Ok(value)
        })
    })
    .with_name(format!("job-{}", job))
}

type JobFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<u64, TaskError>>>>;

fn main() {
    if let Err(e) = initialize_logging(Some(LevelFilter::INFO)) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
        return;
    }

    let config = match RuntimeConfiguration::from_environment() {
        Ok(config) => config,
        Err(e) => {
            fatal_and_exit(format!("failed to load configuration: {}", e));
            return;
        }
    };

    let scheduler = Scheduler::new(config);
    let handle = scheduler.handle();
    let progress = Broker::new();

    let mut updates = progress.subscribe("progress");
    scheduler.spawn_named("reporter", async move {
        while let Ok(update) = updates.next().await {
            info!(%update, "Progress.");
        }
        Ok(())
    });

    let jobs_handle = handle.clone();
    let jobs_progress = progress.clone();
    let jobs = scheduler.spawn_named("jobs", async move {
        let mut scope = jobs_handle.scope::<u64>();
        for job in 0..4 {
            let supervisor = flaky_job(jobs_handle.clone(), jobs_progress.clone(), job);
            let supervised = supervisor.spawn(&jobs_handle);
            scope.spawn(async move { supervised.join().await });
        }

        let result = scope.join_all().await;
        jobs_progress.close("progress");
        result
    });

    let outcome = scheduler.run_until(&jobs);
    let report = scheduler.run();
    info!(
        steps = report.steps,
        completed = report.completed,
        failed = report.failed,
        "Scheduler finished."
    );

    match outcome {
        Ok(values) => info!(total = values.iter().sum::<u64>(), "All jobs succeeded."),
        Err(e) => {
            let remainder = GroupHandler::new()
                .handle_kind(FLAKY, |e| {
                    warn!(error = %e, "Job gave up.");
                    Ok(())
                })
                .handle(e);
            if let Err(e) = remainder {
                fatal_and_exit(format!("jobs failed: {}", e));
            }
        }
    }
}
