use std::path::Path;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod config;
mod coordinator;
mod eid;
mod graph;
mod lock;
mod references;
mod retrieval;
mod semantic;
mod stats;
mod storage;
#[cfg(test)]
mod tests;
mod vault;
mod watcher;
mod web;

use app::{AppContext, AppService};
use cli::Command;
use config::Config;
use graph::ListQuery;
use lock::VaultLock;
use semantic::{CancelToken, SearchQuery};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Mutating commands hold the vault lock so they can't race a running server.
fn lock_vault(root: &Path) -> anyhow::Result<VaultLock> {
    VaultLock::try_acquire(&Config::state_dir(root)).with_context(|| {
        format!(
            "cannot lock {}; stop `vaultd serve` or use its HTTP tools",
            root.display()
        )
    })
}

/// One-shot commands update the index inline; save it before exiting.
fn save_index(service: &AppService) {
    if let Err(e) = service.index().persist_if_dirty() {
        log::warn!("failed to save index: {e}");
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = cli::Args::parse();
    let root = args.vault_root()?;

    match args.command {
        Command::Serve {} => {
            let _lock = lock_vault(&root)?;
            let ctx = AppContext::load(&root)?;
            web::start_daemon(ctx)
        }

        Command::Search {
            query,
            directory,
            tags,
            since,
            limit,
        } => {
            let since = match since.as_deref() {
                Some(raw) => Some(
                    retrieval::parse_since(raw)
                        .with_context(|| format!("unrecognised date '{raw}'"))?,
                ),
                None => None,
            };
            let query = SearchQuery {
                text: query,
                directory,
                tags: tags.as_deref().map(cli::parse_tags).unwrap_or_default(),
                since,
                limit,
            };

            let ctx = AppContext::load(&root)?;
            print_json(&ctx.service().search(&query)?)
        }

        Command::Reindex {} => {
            let _lock = lock_vault(&root)?;
            let ctx = AppContext::load(&root)?;
            let service = ctx.service();

            let bar = indicatif::ProgressBar::new(0);
            bar.set_style(indicatif::ProgressStyle::with_template(
                "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} notes",
            )?);

            let stats = service.rebuild_index(&CancelToken::new(), &|done: usize, total: usize| {
                bar.set_length(total as u64);
                bar.set_position(done as u64);
            });
            bar.finish_and_clear();

            print_json(&stats?)
        }

        Command::References {
            title,
            text_mentions,
        } => {
            let ctx = AppContext::load(&root)?;
            print_json(&ctx.service().find_references(&title, text_mentions)?)
        }

        Command::Move { path, directory } => {
            let _lock = lock_vault(&root)?;
            let ctx = AppContext::load(&root)?;
            let service = ctx.service();
            let result = service.move_note(&path, &directory);
            save_index(&service);
            print_json(&result?)
        }

        Command::Rename { path, title } => {
            let _lock = lock_vault(&root)?;
            let ctx = AppContext::load(&root)?;
            let service = ctx.service();
            let result = service.rename_note(&path, &title);
            save_index(&service);
            print_json(&result?)
        }

        Command::Delete { path, reason } => {
            let _lock = lock_vault(&root)?;
            let ctx = AppContext::load(&root)?;
            let service = ctx.service();
            let result = service.delete_note(&path, reason.as_deref());
            save_index(&service);
            print_json(&result?)
        }

        Command::List {
            directory,
            tag,
            limit,
        } => {
            let ctx = AppContext::load(&root)?;
            let query = ListQuery {
                directory,
                tag,
                limit,
            };
            print_json(&ctx.service().list_notes(&query)?)
        }

        Command::Tags {} => {
            let ctx = AppContext::load(&root)?;
            print_json(&ctx.service().tags()?)
        }

        Command::Stats {} => {
            let ctx = AppContext::load(&root)?;
            print_json(&ctx.service().stats())
        }

        Command::Status {} => {
            let ctx = AppContext::load(&root)?;
            print_json(&ctx.service().index_status())
        }
    }
}
