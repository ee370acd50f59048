use clap::{Parser, Subcommand, ValueEnum};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pageblob")]
#[command(version = "0.1.0")]
#[command(about, long_about = None)]
pub(crate) struct CliArgs {
    #[arg(
        short,
        long,
        help = "A .env file to use to supply environment variables"
    )]
    pub(crate) env_file: Option<String>,
    #[arg(
        short,
        long,
        help = "The path in the object store to the root directory, starting from within the object store bucket (specified when configuring the object store provider)"
    )]
    pub(crate) path: String,

    #[arg(
        long,
        default_value_t = pageblob::DEFAULT_PAGE_SIZE,
        value_parser = parse_page_size,
        help = "The page size in bytes. Every client of a path must use the same value"
    )]
    pub(crate) page_size: u64,

    #[command(subcommand)]
    pub(crate) command: CliCommands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommands {
    /// Creates a zero-filled page blob unless one already exists, then prints its
    /// attributes
    Create {
        /// The blob key, relative to the root path
        #[arg(short, long)]
        key: String,

        /// Number of pages to allocate for a new blob
        #[arg(long, default_value_t = 10)]
        pages: u32,
    },

    /// Prints a blob's size, revision tag and metadata
    Info {
        #[arg(short, long)]
        key: String,
    },

    /// Lists every blob whose key starts with the prefix
    List {
        #[arg(long, default_value = "")]
        prefix: String,
    },

    /// Reads a byte range from a blob. The range need not be page aligned.
    Read {
        #[arg(short, long)]
        key: String,

        /// First byte to read
        #[arg(short, long, default_value_t = 0)]
        start: u64,

        /// End of the range, exclusive. Defaults to the blob's size.
        #[arg(long)]
        end: Option<u64>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Hex)]
        format: OutputFormat,
    },

    /// Appends to many streams from many concurrent writers, then verifies that every
    /// append landed exactly once
    Stress {
        /// Number of streams to write
        #[arg(long, default_value_t = 10)]
        streams: usize,

        /// Number of appends per stream
        #[arg(long, default_value_t = 20)]
        appends: usize,

        /// Number of updates in flight at once
        #[arg(long, default_value_t = 8, value_parser = parse_concurrency)]
        concurrency: usize,

        /// Give up an update after this many conflicting attempts. Retries forever if
        /// not set.
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Pages allocated for each new stream
        #[arg(long, default_value_t = 1)]
        initial_pages: u32,

        /// A stream that outgrows its blob is resized to at least this multiple of its
        /// current size
        #[arg(long, default_value_t = 1.5, value_parser = parse_growth_factor)]
        growth_factor: f64,

        /// Minimum backoff after a conflict, e.g. "10ms". Must be greater than zero.
        #[arg(long, default_value = "10ms")]
        #[clap(value_parser = humantime::parse_duration)]
        min_delay: Duration,

        /// Maximum backoff after a conflict, e.g. "200ms"
        #[arg(long, default_value = "200ms")]
        #[clap(value_parser = humantime::parse_duration)]
        max_delay: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Hex,
    Utf8,
}

fn parse_page_size(s: &str) -> Result<u64, String> {
    let page_size: u64 = s.parse().map_err(|e| format!("invalid page size: {e}"))?;
    if page_size == 0 {
        return Err("page size must be greater than 0".to_string());
    }
    Ok(page_size)
}

fn parse_concurrency(s: &str) -> Result<usize, String> {
    let concurrency: usize = s.parse().map_err(|e| format!("invalid concurrency: {e}"))?;
    if concurrency == 0 {
        return Err("concurrency must be greater than 0".to_string());
    }
    Ok(concurrency)
}

fn parse_growth_factor(s: &str) -> Result<f64, String> {
    let growth_factor: f64 = s
        .parse()
        .map_err(|e| format!("invalid growth factor: {e}"))?;
    if growth_factor.is_nan() || growth_factor < 1.0 {
        return Err("growth factor must be at least 1.0".to_string());
    }
    Ok(growth_factor)
}

pub(crate) fn parse_args() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use crate::args::{parse_growth_factor, parse_page_size, CliArgs, CliCommands, OutputFormat};
    use clap::Parser;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case("1.5", Ok(1.5))]
    #[case("1", Ok(1.0))]
    #[case("0.5", Err("growth factor must be at least 1.0"))]
    #[case("NaN", Err("growth factor must be at least 1.0"))]
    #[case("fast", Err("invalid growth factor"))]
    fn parse_growth_factor_tests(#[case] input: &str, #[case] expected: Result<f64, &str>) {
        match (parse_growth_factor(input), expected) {
            (Ok(value), Ok(expected)) => assert_eq!(expected, value),
            (Err(err), Err(expected)) => assert!(
                err.contains(expected),
                "Expected error to contain '{}', got '{}'",
                expected,
                err
            ),
            result => panic!("Unexpected test case result. {:?}", result),
        }
    }

    #[rstest]
    #[case("512", true)]
    #[case("4096", true)]
    #[case("0", false)]
    #[case("-1", false)]
    fn parse_page_size_tests(#[case] input: &str, #[case] valid: bool) {
        assert_eq!(valid, parse_page_size(input).is_ok());
    }

    #[test]
    fn parses_stress_defaults() {
        let args = CliArgs::try_parse_from(["pageblob", "--path", "/tmp/x", "stress"]).unwrap();
        assert_eq!(512, args.page_size);
        match args.command {
            CliCommands::Stress {
                streams,
                appends,
                concurrency,
                max_attempts,
                initial_pages,
                growth_factor,
                min_delay,
                max_delay,
            } => {
                assert_eq!(10, streams);
                assert_eq!(20, appends);
                assert_eq!(8, concurrency);
                assert_eq!(None, max_attempts);
                assert_eq!(1, initial_pages);
                assert_eq!(1.5, growth_factor);
                assert_eq!(Duration::from_millis(10), min_delay);
                assert_eq!(Duration::from_millis(200), max_delay);
            }
            command => panic!("Unexpected command {:?}", command),
        }
    }

    #[test]
    fn parses_read_range() {
        let args = CliArgs::try_parse_from([
            "pageblob", "--path", "/tmp/x", "read", "--key", "streams/a", "--start", "10",
            "--end", "600", "--format", "utf8",
        ])
        .unwrap();
        match args.command {
            CliCommands::Read {
                key,
                start,
                end,
                format,
            } => {
                assert_eq!("streams/a", key);
                assert_eq!(10, start);
                assert_eq!(Some(600), end);
                assert_eq!(OutputFormat::Utf8, format);
            }
            command => panic!("Unexpected command {:?}", command),
        }
    }

    #[test]
    fn rejects_zero_concurrency() {
        let result = CliArgs::try_parse_from([
            "pageblob",
            "--path",
            "/tmp/x",
            "stress",
            "--concurrency",
            "0",
        ]);
        assert!(result.is_err());
    }
}
