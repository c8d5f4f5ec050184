use log::LevelFilter;

/// Map `-v` occurrences to a level. Warnings and errors are always shown.
pub fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub fn init(verbosity: u8) {
    use env_logger::{Builder, Target};

    // Logs go to stderr; stdout carries only the bound device path.
    let mut builder = Builder::new();
    builder
        .target(Target::Stderr)
        .filter_level(level_for(verbosity));
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}
