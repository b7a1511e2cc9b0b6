use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber. `RUST_LOG` directives are extended with the
/// service and store crates at `info`.
pub fn init_tracing() {
    let mut filter = EnvFilter::from_default_env();
    for directive in ["rollup_service=info", "energy_client=info"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
