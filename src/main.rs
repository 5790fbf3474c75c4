use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match revup::cli::run().await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            revup::ui::output::error(format!("{:#}", err));
            ExitCode::FAILURE
        }
    }
}
