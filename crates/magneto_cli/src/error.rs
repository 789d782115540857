use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Engine(#[from] magneto::error::Error),

    #[error("Magnet link cannot be empty")]
    EmptyMagnet,

    #[error("Invalid magnet link `{0}`, it must start with `magnet:`")]
    InvalidMagnet(String),

    #[error(
        "A .torrent file is required, downloading the metadata from peers is \
         not supported. Pass it with --torrent"
    )]
    MissingMetadata,

    #[error("The torrent has no file to stream")]
    NoTargetFile,

    #[error("Could not launch {0}: {1}")]
    PlayerLaunch(&'static str, std::io::Error),

    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}
