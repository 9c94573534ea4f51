use std::process::ExitCode;

use prefork::AppRegistry;

fn main() -> ExitCode {
    prefork::cli::run(&AppRegistry::with_builtins())
}
