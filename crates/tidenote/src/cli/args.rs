use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Local-first notes shared through storage directories
#[derive(Parser, Debug)]
#[command(name = "tidenote", version, about)]
pub struct Cli {
    /// Use this config file instead of the default one
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage storage directories
    Sd {
        #[command(subcommand)]
        command: SdCommands,
    },

    /// Create, edit and list notes
    Note {
        #[command(subcommand)]
        command: NoteCommands,
    },

    /// Manage the folder tree of a storage directory
    Folder {
        #[command(subcommand)]
        command: FolderCommands,
    },

    /// Pick up changes written by other instances
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },

    /// Finish or roll back interrupted cross-directory moves
    Recover,
}

#[derive(Subcommand, Debug)]
pub enum SdCommands {
    /// Create (or open) a storage directory and add it to the config
    Init {
        /// Directory to use (defaults to ~/Documents/tidenote)
        path: Option<PathBuf>,

        /// Display name
        #[arg(short, long, default_value = "Notes")]
        name: String,
    },

    /// List configured storage directories
    List,

    /// Remove a storage directory from the config (files are kept)
    Remove {
        /// Id, name or path of the storage directory
        sd: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum NoteCommands {
    /// Create a note
    Create {
        /// Storage directory (id, name or path)
        #[arg(long)]
        sd: String,

        /// Folder to create the note in
        #[arg(short, long)]
        folder: Option<String>,

        /// Initial content; the first line becomes the title
        #[arg(short, long)]
        content: Option<String>,
    },

    /// List notes, pinned first
    List {
        #[arg(long)]
        sd: String,

        /// Only notes in this folder
        #[arg(short, long, conflicts_with = "deleted")]
        folder: Option<String>,

        /// Show recently deleted notes instead
        #[arg(long)]
        deleted: bool,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a note's content
    Show {
        #[arg(long)]
        sd: String,
        note: String,

        /// Also print comment threads
        #[arg(long)]
        comments: bool,
    },

    /// Replace a note's content
    Edit {
        #[arg(long)]
        sd: String,
        note: String,
        content: String,
    },

    /// Pin or unpin a note
    Pin {
        #[arg(long)]
        sd: String,
        note: String,

        #[arg(long)]
        off: bool,
    },

    /// Move a note to another folder, or to another storage directory
    Move {
        #[arg(long)]
        sd: String,
        note: String,

        /// Target folder (root if omitted)
        #[arg(short, long)]
        folder: Option<String>,

        /// Target storage directory
        #[arg(long)]
        to: Option<String>,
    },

    /// Move a note to "recently deleted"
    Delete {
        #[arg(long)]
        sd: String,
        note: String,

        /// Delete permanently
        #[arg(long)]
        permanent: bool,
    },

    /// Bring a note back from "recently deleted"
    Restore {
        #[arg(long)]
        sd: String,
        note: String,
    },

    /// Add a comment thread anchored to a text range
    Comment {
        #[arg(long)]
        sd: String,
        note: String,
        text: String,

        /// Start of the anchored range
        #[arg(long, default_value_t = 0)]
        start: u32,

        /// End of the anchored range
        #[arg(long, default_value_t = 0)]
        end: u32,
    },

    /// Fold this instance's logs for a note into a snapshot
    Compact {
        #[arg(long)]
        sd: String,
        note: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum FolderCommands {
    /// Create a folder
    Create {
        #[arg(long)]
        sd: String,
        name: String,

        /// Parent folder id
        #[arg(short, long)]
        parent: Option<String>,
    },

    /// Print the folder tree
    List {
        #[arg(long)]
        sd: String,
    },

    /// Rename a folder
    Rename {
        #[arg(long)]
        sd: String,
        folder: String,
        name: String,
    },

    /// Move a folder under another parent (root if omitted)
    Move {
        #[arg(long)]
        sd: String,
        folder: String,

        #[arg(short, long)]
        parent: Option<String>,
    },

    /// Delete a folder; its notes show up at the root
    Delete {
        #[arg(long)]
        sd: String,
        folder: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum SyncCommands {
    /// Run a single sync pass and print what it did
    Once,

    /// Keep syncing until Ctrl+C
    Watch,

    /// Show pending and degraded state after one pass
    Status,
}
