// JSON result emission for every subcommand

use serde::Serialize;
use std::io::Write;

/// Serialize `value` (pretty unless `compact`) and write it to `output_path`,
/// or to stdout followed by a newline when no path is given
pub fn emit<T: Serialize>(value: &T, compact: bool, output_path: Option<&str>) -> Result<(), String> {
    let rendered = if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    }
    .map_err(|e| format!("Could not encode result as JSON: {}", e))?;

    match output_path {
        Some(path) => std::fs::write(path, rendered)
            .map_err(|e| format!("Could not write result to '{}': {}", path, e)),
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", rendered).map_err(|e| format!("Could not write result: {}", e))
        }
    }
}
