use argh::FromArgs;

#[derive(FromArgs, PartialEq, Debug)]
/// run one publication cycle for every configured channel/device pipeline
#[argh(subcommand, name = "publish")]
pub(crate) struct Publish {}

#[derive(FromArgs, PartialEq, Debug)]
/// remove orphaned pool/index files not referenced by any channel
#[argh(subcommand, name = "gc")]
pub(crate) struct Gc {}

#[derive(FromArgs, PartialEq, Debug)]
/// trim old full images (and their now-orphaned deltas) below a keep count
#[argh(subcommand, name = "expire")]
pub(crate) struct Expire {
    /// channel to expire images in
    #[argh(option)]
    pub channel: String,
    /// device to expire images in
    #[argh(option)]
    pub device: String,
    /// number of full images to keep; defaults to the config's default_keep_full
    #[argh(option)]
    pub keep: Option<usize>,
}

#[derive(FromArgs, PartialEq, Debug)]
/// reconcile alias and redirect channels with a target channel
#[argh(subcommand, name = "sync")]
pub(crate) struct Sync {
    /// channel name to sync aliases/redirects for
    #[argh(option)]
    pub channel: String,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub(crate) enum Command {
    Publish(Publish),
    Gc(Gc),
    Expire(Expire),
    Sync(Sync),
}

#[derive(FromArgs, PartialEq, Debug)]
/// imagetree: signed, content-addressed OTA image publication server
pub(crate) struct Args {
    /// path to the TOML configuration file
    #[argh(option, short = 'c')]
    pub config: String,
    /// signing certificate path, overriding the config file's server.signing_key
    #[argh(option)]
    pub signing_key: Option<String>,
    #[argh(subcommand)]
    pub command: Command,
}
