use std::fs::File;

use time::{format_description, OffsetDateTime};
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, FmtSubscriber};

/// Sets up a plain-text file logger for the whole session. Will panic on
/// error (e.g. when a global subscriber is already installed).
pub fn init_logger(max_level: Level) {
    let file = File::create(log_file_name()).unwrap();
    let local_offset = time::UtcOffset::current_local_offset().unwrap();
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]").unwrap(),
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(max_level)
        .with_ansi(false)
        .with_timer(timer)
        .with_writer(BoxMakeWriter::new(file))
        .finish();

    set_global_default(subscriber).expect(
        "Could not set global default tracing subscriber. \
         Consider disabling logs if you are already setting a subscriber.",
    );
}

fn log_file_name() -> String {
    let format = format_description::parse("race_[year]-[month]-[day]_[hour][minute][second].log")
        .unwrap();
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(&format).unwrap()
}
