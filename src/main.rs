use std::{error::Error, sync::Arc};

use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::lib::{
    config::types::Args,
    pull::copier::SkopeoCopier,
    runtime::docker::DockerRuntime,
    worker::{
        types::{TaskServer, Worker},
        worker::sweep_bindings,
    },
};

mod lib {
    pub mod config {
        pub mod types;
    }
    pub mod errors {
        pub mod classifier;
        pub mod types;
    }
    pub mod runtime {
        pub mod docker;
        #[cfg(test)]
        pub mod fake;
        pub mod types;
    }
    pub mod pull {
        pub mod analyzer;
        pub mod copier;
        pub mod pipeline;
        pub mod progress;
        pub mod types;
    }
    pub mod session {
        pub mod router;
        pub mod sender;
        pub mod types;
    }
    pub mod replace {
        pub mod orchestrator;
        pub mod state;
        pub mod types;
    }
    pub mod worker {
        pub mod api;
        pub mod stats;
        pub mod types;
        pub mod worker;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("dockhand=info,tower=warn,hyper=warn")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let settings = args.pull_settings();
    info!(
        listen = %args.listen,
        copy_tool = %args.copy_tool,
        mirrors = settings.mirrors.len(),
        proxied = settings.proxy_url.is_some(),
        "Starting dockhand"
    );

    let runtime = Arc::new(DockerRuntime::connect()?);
    let copier = Arc::new(SkopeoCopier::new(args.copy_tool.clone()));
    let worker = Arc::new(Worker::new(runtime, copier, settings));

    tokio::spawn(sweep_bindings(
        worker.router.clone(),
        args.binding_ttl(),
        args.sweep_interval(),
    ));

    TaskServer::new(worker, &args.listen).start_server().await?;

    Ok(())
}
