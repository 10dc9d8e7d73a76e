use argh::FromArgs;

/// SPICE session broker: authenticates users and relays SPICE traffic to an
/// ephemeral per-session TCP listener.
#[derive(Debug, FromArgs)]
pub struct Args {
    /// path to an optional `.env` file to seed the process environment
    /// before reading broker configuration
    #[argh(option)]
    pub dotenv: Option<String>,
}
