//! Command-line arguments for `node-api`.

use std::path::PathBuf;

use structopt::StructOpt;

/// Serves the local chain archive to node-to-node peers.
#[derive(Debug, StructOpt)]
#[structopt(name = "node-api")]
pub struct Args {
    /// The directory holding the chunk archive.
    #[structopt(parse(from_os_str))]
    pub data_dir: PathBuf,

    /// The address to listen on.
    #[structopt(long, default_value = "127.0.0.1")]
    pub ip: String,

    /// The port to listen on.
    #[structopt(long, default_value = "3001")]
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        grevy_test::init();

        let args =
            Args::from_iter_safe(["node-api", "/var/lib/grevy"]).expect("the data dir suffices");
        assert_eq!(args.data_dir, PathBuf::from("/var/lib/grevy"));
        assert_eq!(args.ip, "127.0.0.1");
        assert_eq!(args.port, 3001);

        let args = Args::from_iter_safe(["node-api", "/tmp/chain", "--ip=0.0.0.0", "--port=4001"])
            .expect("overrides parse");
        assert_eq!(args.ip, "0.0.0.0");
        assert_eq!(args.port, 4001);

        assert!(Args::from_iter_safe(["node-api"]).is_err());
    }
}
