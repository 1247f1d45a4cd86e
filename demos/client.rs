use argh::FromArgs;
use base64::{Engine, engine::general_purpose::STANDARD};
use scene_voice::messages::{AskRequest, CaptionRequest};
use std::path::{Path, PathBuf};

// defaults for the client
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5000;

#[derive(FromArgs)]
/// scene-voice client for describing images and asking about them
struct ClientArgs {
    /// the host to connect to
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to connect to
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// command to execute: "caption", "ask" or "status"
    #[argh(subcommand)]
    command: ClientCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum ClientCommands {
    Caption(CaptionCommand),
    Ask(AskCommand),
    Status(StatusCommand),
}

#[derive(FromArgs)]
/// Describe an image in Korean
#[argh(subcommand, name = "caption")]
struct CaptionCommand {
    /// the path to the image
    #[argh(option, short = 'i')]
    image_path: PathBuf,
}

#[derive(FromArgs)]
/// Ask a question about an image
#[argh(subcommand, name = "ask")]
struct AskCommand {
    /// the path to the image
    #[argh(option, short = 'i')]
    image_path: PathBuf,

    /// the question to ask
    #[argh(option, short = 'q')]
    question: String,
}

#[derive(FromArgs)]
/// Check the server status
#[argh(subcommand, name = "status")]
struct StatusCommand {}

fn encode_image(path: &Path) -> std::io::Result<String> {
    Ok(STANDARD.encode(std::fs::read(path)?))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: ClientArgs = argh::from_env();

    let client = reqwest::Client::new();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    let response = match args.command {
        ClientCommands::Caption(command) => {
            client
                .post(format!("http://{}/api/caption", addr))
                .json(&CaptionRequest {
                    image: Some(encode_image(&command.image_path)?),
                })
                .send()
                .await?
        }
        ClientCommands::Ask(command) => {
            client
                .post(format!("http://{}/api/ask", addr))
                .json(&AskRequest {
                    question: Some(command.question),
                    image: Some(encode_image(&command.image_path)?),
                })
                .send()
                .await?
        }
        ClientCommands::Status(_) => {
            client
                .get(format!("http://{}/api/status", addr))
                .send()
                .await?
        }
    };

    let status = response.status();
    let result = response.json::<serde_json::Value>().await?;
    println!("Result ({}): {}", status, serde_json::to_string_pretty(&result)?);

    Ok(())
}
