//! Media players that can open a file that is still being downloaded.
use std::{
    env,
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::process::{Child, Command};
use tracing::info;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Player {
    pub name: &'static str,
    pub args: &'static [&'static str],
}

/// In order of preference, mpv copes better with incomplete files.
pub const PLAYERS: [Player; 2] = [
    Player { name: "mpv", args: &["--force-seekable=yes"] },
    Player { name: "vlc", args: &["--file-caching=10000"] },
];

/// The first player that is installed.
pub fn find_player() -> Option<(Player, PathBuf)> {
    let mut dirs: Vec<PathBuf> =
        env::var_os("PATH").map(|p| env::split_paths(&p).collect()).unwrap_or_default();
    dirs.push(PathBuf::from("/snap/bin"));

    find_in(&PLAYERS, &dirs)
}

fn find_in(players: &[Player], dirs: &[PathBuf]) -> Option<(Player, PathBuf)> {
    players.iter().find_map(|player| {
        dirs.iter()
            .map(|dir| dir.join(player.name))
            .find(|bin| bin.is_file())
            .map(|bin| (*player, bin))
    })
}

/// Open `file` in the background, the player outlives us.
pub fn launch(player: Player, bin: &Path, file: &Path) -> Result<Child, Error> {
    info!("opening {file:?} with {}", player.name);

    Command::new(bin)
        .args(player.args)
        .arg(file)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::PlayerLaunch(player.name, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_the_first_player_found() {
        let dir = env::temp_dir().join(format!("magneto-player-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let dirs = vec![dir.clone()];

        assert_eq!(find_in(&PLAYERS, &dirs), None);

        std::fs::write(dir.join("vlc"), b"").unwrap();
        let (player, bin) = find_in(&PLAYERS, &dirs).unwrap();
        assert_eq!(player.name, "vlc");
        assert_eq!(bin, dir.join("vlc"));

        std::fs::write(dir.join("mpv"), b"").unwrap();
        assert_eq!(find_in(&PLAYERS, &dirs).unwrap().0.name, "mpv");

        std::fs::remove_dir_all(dir).unwrap();
    }
}
