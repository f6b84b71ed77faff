use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let matches = pkrguard_cli::cli().get_matches();
    let mut stdout = std::io::stdout();
    match pkrguard_cli::run(&matches, &mut stdout).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(pkrguard_cli::EXIT_ERROR)
        }
    }
}
