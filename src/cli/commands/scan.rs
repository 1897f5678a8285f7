//! Library scanning, album listing and file watching commands.

use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::config::Config;
use crate::library::{
    AlbumLibrary, CoPool, FileLibrary, JsonCodec, NotifyWatcher, Persistent, Progress, Signal,
    WatchedFileLibrary,
};
use crate::metadata::{AudioFile, TagLoader};

use super::library_roots;

/// Time slice given to background tasks per loop turn while watching.
const WATCH_SLICE: Duration = Duration::from_millis(50);
/// Sleep between event polls when there is nothing to do.
const IDLE_SLEEP: Duration = Duration::from_millis(200);
/// How often a dirty library is saved while watching.
const SAVE_INTERVAL: Duration = Duration::from_secs(30);

/// Open the song library and load its saved state.
fn open_library(config: &Config) -> FileLibrary<AudioFile> {
    let songs = FileLibrary::new("songs", Rc::new(TagLoader))
        .with_pacing(config.scan.pacing())
        .with_skip_hidden(config.library.skip_hidden);
    let count = songs.load(&config.library.library_file, &JsonCodec::default());
    info!(
        target: "tunedex::cli",
        path = %config.library.library_file.display(),
        count,
        "Loaded library"
    );
    songs
}

fn save_library(songs: &impl Persistent<AudioFile>, config: &Config) -> anyhow::Result<()> {
    let path = &config.library.library_file;
    if !songs.save(path, &JsonCodec::default()) {
        anyhow::bail!("Could not save library to {}", path.display());
    }
    Ok(())
}

/// Print progress on one line, at most once per phase change or 100 items.
fn report(progress: Progress, last: &mut Option<Progress>) -> anyhow::Result<()> {
    let due = match last {
        Some(prev) => prev.phase != progress.phase || progress.done >= prev.done + 100,
        None => true,
    };
    if due {
        print!("\r{progress:<40}");
        std::io::stdout().flush()?;
        *last = Some(progress);
    }
    Ok(())
}

/// Bring the saved library up to date with the disk
pub fn cmd_scan(config: &Config, paths: &[PathBuf], force: bool) -> anyhow::Result<()> {
    let roots = library_roots(config, paths)?;
    let songs = open_library(config);
    println!("Scanning {} path(s)...", roots.len());

    let mut last = None;
    for progress in songs.rebuild(&roots, force, &config.library.exclude) {
        report(progress, &mut last)?;
    }
    println!();

    if songs.is_dirty() || !config.library.library_file.exists() {
        save_library(&songs, config)?;
    }

    let albums = AlbumLibrary::attach(&songs);
    let masked: usize = songs
        .masked_mount_points()
        .iter()
        .map(|point| songs.get_masked(point).len())
        .sum();
    println!(
        "Scan complete: {} tracks in {} albums ({} on unmounted volumes)",
        songs.len(),
        albums.len(),
        masked
    );
    Ok(())
}

/// List albums in the saved library
pub fn cmd_albums(config: &Config) -> anyhow::Result<()> {
    let songs = open_library(config);
    let albums = AlbumLibrary::attach(&songs);

    let mut entries = albums.values();
    entries.sort_by_key(|album| album.key());
    for album in entries {
        let album = album.borrow();
        let summary = album.summary();
        let minutes = summary.duration.as_secs() / 60;
        let seconds = summary.duration.as_secs() % 60;
        println!(
            "{} - {} [{}] ({} tracks, {}:{:02})",
            summary.artist.as_deref().unwrap_or("Unknown Artist"),
            summary.title.as_deref().unwrap_or("Unknown Album"),
            summary.date.as_deref().unwrap_or("----"),
            summary.tracks,
            minutes,
            seconds
        );
    }
    println!("{} albums, {} tracks", albums.len(), songs.len());
    Ok(())
}

/// Keep the library updated while files change
pub fn cmd_watch(
    config: &Config,
    paths: &[PathBuf],
    seconds: Option<u64>,
    verbose: bool,
) -> anyhow::Result<()> {
    if !config.library.watch_for_changes {
        info!(
            target: "tunedex::cli",
            "File watching is disabled in the configuration, scanning once instead"
        );
        return cmd_scan(config, paths, false);
    }

    let roots = library_roots(config, paths)?;
    let exclude = &config.library.exclude;
    let watcher = NotifyWatcher::new()?;
    let library = WatchedFileLibrary::new(open_library(config), Box::new(watcher));
    let albums = AlbumLibrary::attach(&library);

    if verbose {
        for (signal, mark) in [
            (Signal::Added, '+'),
            (Signal::Removed, '-'),
            (Signal::Changed, '~'),
        ] {
            library.connect(signal, move |items| {
                for item in items {
                    println!("{mark} {}", item.borrow().path.display());
                }
            });
        }
    }

    let mut pool = CoPool::new();
    pool.add("rebuild", library.rebuild(&roots, false, exclude));
    pool.add("watch", library.start_watching(&roots, exclude));

    println!("Watching for changes in {} path(s)", roots.len());
    println!("Press Ctrl+C to stop.\n");

    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let mut last_save = Instant::now();

    loop {
        let events = library.process_events();
        if library.has_deferred() && !pool.contains("deferred") {
            pool.add("deferred", library.run_deferred());
        }

        if pool.is_idle() && events == 0 {
            std::thread::sleep(IDLE_SLEEP);
        } else {
            pool.run_for(WATCH_SLICE);
        }

        if library.is_dirty() && last_save.elapsed() >= SAVE_INTERVAL {
            save_library(&library, config)?;
            last_save = Instant::now();
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
    }

    // Unfinished tasks flush their pending signals when dropped.
    drop(pool);
    library.stop_watching();
    info!(
        target: "tunedex::cli",
        tracks = library.len(),
        albums = albums.len(),
        "File watcher stopped"
    );
    if library.is_dirty() {
        save_library(&library, config)?;
    }
    Ok(())
}
