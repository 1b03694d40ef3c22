/// Initializes logging to a database-scoped folder: `{db_name}_logs`,
/// rooted at `base` — used when the data file lives somewhere other
/// than the current directory. Creates the folder if missing and
/// writes rolling log files.
pub fn init_for_db_in(base: &std::path::Path, db_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    use log::LevelFilter;
    use log4rs::append::file::FileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let log_dir = base.join(format!("{db_name}_logs"));
    std::fs::create_dir_all(&log_dir)?;
    let logfile = log_dir.join("monolite.log");
    let encoder = Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}"));
    let file_appender = FileAppender::builder().encoder(encoder).build(logfile)?;
    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .build(Root::builder().appender("file").build(LevelFilter::Info))?;
    log4rs::init_config(config)?;
    Ok(())
}
