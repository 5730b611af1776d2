use stress_test::{stress_test_collections, stress_test_scaling, stress_test_variables};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("error"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            PROXY STRESS TESTS                               ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut converged = true;

    // Test 1: collections, small and lossless
    let stats = stress_test_collections(4, 100, 0.0).await?;
    stats.print();
    converged &= stats.converged;

    // Test 2: collections, small and lossy
    let stats = stress_test_collections(4, 100, 0.2).await?;
    stats.print();
    converged &= stats.converged;

    // Test 3: variables racing through barriers
    let stats = stress_test_variables(4, 100, 0.2).await?;
    stats.print();
    converged &= stats.converged;

    // Test 4: collections, medium scale
    let stats = stress_test_collections(10, 300, 0.1).await?;
    stats.print();
    converged &= stats.converged;

    // Test 5: Scaling analysis
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║          SCALING ANALYSIS (Collections)                    ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    stress_test_scaling(12, 4).await?;

    if !converged {
        return Err("some replicas did not converge with the store".into());
    }
    println!("\n✓ All stress tests completed successfully!");
    Ok(())
}
