//! Terminal front ends for the server observer and the client display.

use murmur_chat::{ChatDisplay, ServerObserver};

/// Prints operator notifications to stdout.
pub struct ConsoleObserver;

impl ServerObserver for ConsoleObserver {
    fn on_load_changed(&self, count: usize) {
        println!("Current Load: {count} Users");
    }

    fn on_status_changed(&self, online: bool) {
        println!("Server Status: {}", if online { "Online" } else { "Offline" });
    }

    fn on_error(&self, message: &str) {
        eprintln!("{message}");
    }
}

/// Prints chat lines to stdout and problems to stderr.
pub struct ConsoleDisplay;

impl ChatDisplay for ConsoleDisplay {
    fn on_message_received(&self, text: &str) {
        println!("{text}");
    }

    fn on_error(&self, text: &str) {
        eprintln!("{text}");
    }

    fn clear(&self) {
        // ANSI clear screen, cursor home
        print!("\x1b[2J\x1b[H");
    }
}
