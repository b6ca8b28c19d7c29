use crate::cli::ValidateArgs;
use crate::exit_codes;
use crate::output;
use evoked_rt::AveragingConfig;
use serde::Serialize;

#[derive(Serialize)]
struct ValidateOutput {
    file: String,
    valid: bool,
    channels: Option<usize>,
    epoch_length: Option<usize>,
    error: Option<String>,
}

pub fn execute(args: ValidateArgs) -> i32 {
    let (config, error) = match AveragingConfig::from_json_file(&args.file) {
        Ok(config) => (Some(config), None),
        Err(e) => (None, Some(format!("{}: {}", args.file, e))),
    };

    let result = ValidateOutput {
        file: args.file.clone(),
        valid: error.is_none(),
        channels: config.as_ref().map(|c| c.num_channels()),
        epoch_length: config.as_ref().map(|c| c.epoch_length()),
        error: error.clone(),
    };

    if args.json {
        if let Err(e) = output::emit(&result, false, None) {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    } else if let Some(ref err) = error {
        eprintln!("Error: {}", err);
    } else if let Some(ref config) = config {
        println!(
            "Config '{}' is valid ({} channels, {} + {} samples, {:?} average of {})",
            args.file,
            config.num_channels(),
            config.pre_stim_samples,
            config.post_stim_samples,
            config.average_mode,
            config.num_averages
        );
    }

    if error.is_some() {
        exit_codes::INPUT_ERROR
    } else {
        exit_codes::SUCCESS
    }
}
