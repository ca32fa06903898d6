use simulation::{run_simulation, SimulationConfig, SimulationConfigBuilder};
use tracing::error;
use tracing_subscriber::EnvFilter;
pub mod simulation;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            TOPIC REPLICATION SIMULATIONS                   ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let runs = [
        // Run 1: four nodes, ten producers, ten inserts each
        SimulationConfig::default(),
        // Run 2: wider cluster, more traffic
        SimulationConfigBuilder::new()
            .nodes(8)
            .producers(20)
            .inserts_per_producer(50)
            .max_delay_ms(5)
            .build(),
    ];

    for config in &runs {
        match run_simulation(config).await {
            Ok(stats) => stats.print(),
            Err(e) => {
                error!(error = %e, "simulation failed");
                return Err(e.into());
            }
        }
    }

    println!("\n✓ All simulations completed successfully!");
    Ok(())
}
