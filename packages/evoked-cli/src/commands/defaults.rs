use crate::cli::DefaultsArgs;
use crate::exit_codes;
use crate::output;
use evoked_rt::{BlockSource, SyntheticConfig, SyntheticSource};

pub fn execute(args: DefaultsArgs) -> i32 {
    let source = match SyntheticSource::new(SyntheticConfig {
        data_channels: args.channels,
        ..Default::default()
    }) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let config = source.metadata().averaging_config();
    match output::emit(&config, args.compact, args.output.as_deref()) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit_codes::EXECUTION_ERROR
        }
    }
}
