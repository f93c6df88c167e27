//! CLI module
//!
//! This module provides the command-line interface for the decompbox tool.
//! Every command opens the session of the selected problem from the local
//! store, applies one operation and exits.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use colored::{ColoredString, Colorize};
use std::io;

use crate::{
    api::{Client, ClientConfig, CodeFeedback, ExecAction, HttpClient},
    auth::Credentials,
    layout::{NodeBox, Point},
    models::{
        parse_path, path_label, Correctness, Divisibility, HintKind, Step, StepPath, StepStatus,
        StepTree,
    },
    session::{CheckReport, Context, Core, SessionConfig, SessionError},
    storage::FileStore,
};

const STORE_FILE: &str = "store.json";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Backend URL
    #[arg(short, long, env = "DECOMP_SERVER", default_value = "http://localhost:8000")]
    server: String,

    /// Directory holding the local store
    #[arg(long, env = "DECOMP_DATA_DIR", default_value = ".decompbox")]
    data_dir: PathBuf,

    /// Problem whose step tree is worked on
    #[arg(short, long, env = "DECOMP_PROBLEM", default_value = "default")]
    problem: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an account and log in
    Signup {
        username: String,
        email: String,
        password: String,
    },

    /// Log in with an existing account
    Login { username: String, password: String },

    /// Forget the stored token
    Logout,

    /// Show login state and progress of the current problem
    Status,

    /// Replace the local tree with the one saved on the backend
    Load,

    /// Save the local tree to the backend
    Save,

    /// Print the step tree
    Show,

    /// Set the problem statement sent along with checks
    Problem {
        /// Problem statement
        text: String,
    },

    /// Add a step
    Add {
        /// Step content
        content: String,

        /// Parent path (e.g. 0 or 0,1); defaults to the top level
        #[arg(long, default_value = "")]
        parent: String,

        /// Position among the parent's children; defaults to the end
        #[arg(short, long)]
        index: Option<usize>,
    },

    /// Replace the content of a step
    Edit {
        /// Step path (e.g. 0,1)
        path: String,
        /// New content
        content: String,
    },

    /// Remove a step and its subtree
    Remove {
        /// Step id
        id: String,
    },

    /// Expand or collapse a step
    Expand {
        /// Step id
        id: String,

        #[arg(long)]
        collapse: bool,
    },

    /// Select a step
    Select {
        /// Step id
        id: String,

        #[arg(long)]
        clear: bool,
    },

    /// Replace a step with its correct version
    Reveal {
        /// Step path (e.g. 0,1)
        path: String,
    },

    /// Show or hide one of a step's hints
    Hint {
        /// Step id
        id: String,
        /// general or detailed
        kind: HintKind,
    },

    /// Check every step
    Check,

    /// Generate hints for every step
    Hints,

    /// Replace the children of a step with an abstraction
    Abstract {
        /// Step path (e.g. 0,1); empty for the whole tree
        #[arg(default_value = "")]
        path: String,
    },

    /// Generate code from the steps
    Code,

    /// Review the problem's code
    CheckCode {
        /// Use the code in this file instead of the stored code
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Run the problem's code
    Run {
        /// Use the code in this file instead of the stored code
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// run, compile or test
        #[arg(short, long, default_value = "run")]
        action: ExecAction,
    },

    /// Print the computed box positions
    Layout,

    /// Drag a new step onto the tree and drop it at a pointer position
    Drop {
        #[arg(long)]
        x: f64,
        #[arg(long)]
        y: f64,

        /// Content of the dropped step
        content: String,
    },

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Run the CLI application
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        generate(*shell, &mut cmd, name, &mut io::stdout());
        return Ok(());
    }

    let core = open_core(&cli.data_dir, &cli.problem)?;

    match &cli.command {
        Commands::Signup {
            username,
            email,
            password,
        } => {
            let client = create_client(&cli.server, None);
            let token = client.signup(username, email, password).await?;
            let credentials = Credentials::new(token, Utc::now()).with_username(username);
            core.update(|c| c.login(&credentials))?;
            println!("Signed up and logged in as {}", username.bold());
        }

        Commands::Login { username, password } => {
            let client = create_client(&cli.server, None);
            let token = client.login(username, password).await?;
            let credentials = Credentials::new(token, Utc::now()).with_username(username);
            core.update(|c| c.login(&credentials))?;
            println!("Logged in as {}", username.bold());
        }

        Commands::Logout => {
            core.update(|c| c.logout())?;
            println!("Logged out");
        }

        Commands::Status => {
            let credentials = core.update(|c| c.credentials(Utc::now()))?;
            match credentials {
                Some(credentials) => println!(
                    "Logged in as {} (since {})",
                    credentials.username.as_deref().unwrap_or("unknown").bold(),
                    credentials.issued_at.format("%Y-%m-%d %H:%M UTC")
                ),
                None => println!("Not logged in"),
            }
            core.read(|c| {
                println!("Problem: {}", c.problem_id());
                print_progress(c.tree());
            });
        }

        Commands::Load => {
            let client = authenticated_client(&cli.server, &core)?;
            core.load_tree(&client).await?;
            core.read(|c| print_tree(c.tree()));
        }

        Commands::Save => {
            let client = authenticated_client(&cli.server, &core)?;
            core.save_tree(&client).await?;
            println!("Saved steps of problem {}", cli.problem);
        }

        Commands::Show => {
            core.read(|c| {
                if !c.problem_text().is_empty() {
                    println!("{}\n", c.problem_text().italic());
                }
                print_tree(c.tree());
                print_progress(c.tree());
            });
        }

        Commands::Problem { text } => {
            core.update(|c| c.set_problem_text(text.clone()))?;
            println!("Problem statement updated");
        }

        Commands::Add {
            content,
            parent,
            index,
        } => {
            let parent = parse_path(parent)?;
            let path = core.update(|c| match index {
                Some(index) => {
                    let step = Step::new(c.new_step_id(), content.clone());
                    c.insert_step(&parent, *index, step)
                }
                None => c.add_step(&parent, content.clone()),
            })?;
            print_step_at(&core, &path, "Added");
        }

        Commands::Edit { path, content } => {
            let path = parse_path(path)?;
            core.update(|c| c.edit_content(&path, content.clone()))?;
            print_step_at(&core, &path, "Updated");
        }

        Commands::Remove { id } => {
            let grace = core.read(|c| c.config().removal_grace);
            core.update(|c| c.begin_removal(id, Instant::now()))?;
            tokio::time::sleep(grace).await;
            let removed = core.update(|c| c.complete_due_removals(Instant::now()))?;
            for id in removed {
                println!("Removed step {}", id);
            }
        }

        Commands::Expand { id, collapse } => {
            core.update(|c| c.set_expanded(id, !*collapse))?;
            println!("{} step {}", if *collapse { "Collapsed" } else { "Expanded" }, id);
        }

        Commands::Select { id, clear } => {
            core.update(|c| c.set_selected(id, !*clear))?;
            println!("{} step {}", if *clear { "Deselected" } else { "Selected" }, id);
        }

        Commands::Reveal { path } => {
            let path = parse_path(path)?;
            core.update(|c| c.reveal_correct_step(&path))?;
            print_step_at(&core, &path, "Revealed");
        }

        Commands::Hint { id, kind } => {
            core.update(|c| c.toggle_hint(id, *kind))?;
            core.read(|c| {
                if let Some(step) = c.tree().find_by_id(id) {
                    let shown = step.hints_visible().get(*kind);
                    match (shown, step.hint(*kind)) {
                        (true, Some(hint)) => println!("{} hint: {}", kind, hint),
                        (true, None) => println!("No {} hint yet; run 'decompbox hints'", kind),
                        (false, _) => println!("{} hint hidden", kind),
                    }
                }
            });
        }

        Commands::Check => {
            let client = authenticated_client(&cli.server, &core)?;
            let report = core.check_steps(&client).await?;
            print_report(&report);
            core.read(|c| {
                print_tree(c.tree());
                print_progress(c.tree());
            });
        }

        Commands::Hints => {
            let client = authenticated_client(&cli.server, &core)?;
            let report = core.generate_hints(&client).await?;
            print_report(&report);
        }

        Commands::Abstract { path } => {
            let path = parse_path(path)?;
            let client = authenticated_client(&cli.server, &core)?;
            core.request_abstraction(&client, path).await?;
            core.read(|c| print_tree(c.tree()));
        }

        Commands::Code => {
            let client = authenticated_client(&cli.server, &core)?;
            let code = core.steps_to_code(&client).await?;
            println!("{}", code);
        }

        Commands::CheckCode { file } => {
            load_code_file(&core, file.as_deref())?;
            let client = authenticated_client(&cli.server, &core)?;
            let feedback = core.check_code(&client).await?;
            print_feedback(&feedback);
        }

        Commands::Run { file, action } => {
            load_code_file(&core, file.as_deref())?;
            let client = authenticated_client(&cli.server, &core)?;
            let output = core.execute(&client, *action).await?;
            println!("{}", output);
        }

        Commands::Layout => {
            let boxes = core.update(|c| c.layout());
            print_layout(&boxes);
        }

        Commands::Drop { x, y, content } => {
            let landed = core.update(|c| -> Result<Option<StepPath>, SessionError> {
                c.start_drag();
                let target = c.drag_to(Point::new(*x, *y))?;
                if let Some(preview) = c.drag_preview() {
                    tracing::debug!("Ghost preview has {} steps", preview.len());
                }
                if target.is_none() {
                    c.cancel_drag();
                    return Ok(None);
                }
                let Some(target) = c.drop_drag()? else {
                    return Ok(None);
                };

                let mut path = target.parent.clone();
                path.push(target.index);
                c.edit_content(&path, content.clone())?;
                Ok(Some(path))
            })?;

            match landed {
                Some(path) => print_step_at(&core, &path, "Dropped"),
                None => println!("No insert target near ({}, {}); step discarded", x, y),
            }
        }

        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn open_core(data_dir: &Path, problem: &str) -> Result<Core, Box<dyn std::error::Error>> {
    let store = FileStore::open(data_dir.join(STORE_FILE))?;
    let context = Context::open(problem, Box::new(store), SessionConfig::default())?;
    Ok(Core::new(context))
}

fn create_client(server_url: &str, token: Option<String>) -> HttpClient {
    let config = ClientConfig {
        base_url: server_url.to_string(),
        ..ClientConfig::default()
    };

    let client = HttpClient::with_config(config);
    match token {
        Some(token) => client.with_token(token),
        None => client,
    }
}

/// A client carrying the stored token; errors if the session has expired
fn authenticated_client(
    server_url: &str,
    core: &Core,
) -> Result<HttpClient, Box<dyn std::error::Error>> {
    match core.update(|c| c.credentials(Utc::now()))? {
        Some(credentials) => Ok(create_client(server_url, Some(credentials.token))),
        None => Err("Not logged in. Use 'decompbox login' first.".into()),
    }
}

fn load_code_file(core: &Core, file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(file) = file {
        let code = std::fs::read_to_string(file)?;
        core.update(|c| c.set_code(code))?;
    }
    Ok(())
}

fn status_marker(status: StepStatus) -> ColoredString {
    match status.correctness {
        Correctness::Correct => "[✓]".green(),
        Correctness::Incorrect => "[✗]".red(),
        Correctness::Missing => "[?]".yellow(),
        Correctness::Unset => "[ ]".normal(),
    }
}

fn print_step_at(core: &Core, path: &[usize], verb: &str) {
    core.read(|c| {
        if let Some(step) = c.tree().get(path) {
            println!(
                "{} step {}: \"{}\" (id {})",
                verb,
                path_label(path),
                step.content(),
                step.id()
            );
        }
    });
}

fn print_tree(tree: &StepTree) {
    if tree.is_empty() {
        println!("  No steps yet. Add some with 'decompbox add'");
        return;
    }

    for (path, step) in tree.walk() {
        print_step(step, &path);
    }
}

fn print_step(step: &Step, path: &StepPath) {
    let indent = "  ".repeat(path.len());
    let label = format!("Step {}", path_label(path));
    let label = if step.is_deleting() {
        label.strikethrough()
    } else {
        label.bold()
    };

    let fold = match (step.is_leaf(), step.is_expanded()) {
        (true, _) => " ",
        (false, true) => "▾",
        (false, false) => "▸",
    };
    let selected = if step.is_selected() { "*" } else { " " };
    let complete = if !step.is_leaf() && step.is_fully_correct() {
        " (all substeps correct)".green().to_string()
    } else {
        String::new()
    };

    let divisible = match step.status().can_be_further_divided {
        Divisibility::Can => " (can be divided further)".cyan().to_string(),
        Divisibility::Cannot | Divisibility::Unset => String::new(),
    };

    println!(
        "{}{}{}{} {} {}{}{}",
        indent,
        selected,
        fold,
        status_marker(step.status()),
        label,
        step.content(),
        divisible,
        complete
    );

    for kind in [HintKind::General, HintKind::Detailed] {
        if step.hints_visible().get(kind) {
            if let Some(hint) = step.hint(kind) {
                println!("{}    {} {}", indent, format!("{} hint:", kind).dimmed(), hint);
            }
        }
    }
    if step.correct_step().is_some() && step.status().correctness == Correctness::Incorrect {
        println!("{}    {}", indent, "correct version available (reveal)".dimmed());
    }
}

fn print_progress(tree: &StepTree) {
    let progress = tree.progress();
    let summary = format!(
        "{}/{} correct, {} incorrect, {} missing, {} unchecked",
        progress.correct, progress.total, progress.incorrect, progress.missing, progress.unset
    );
    if progress.is_complete() {
        println!("\n{} {}", "All steps correct:".green().bold(), summary);
    } else {
        println!("\nProgress: {}", summary);
    }
}

fn print_report(report: &CheckReport) {
    println!("Updated {} steps", report.applied.len());
    if !report.ignored.is_empty() {
        println!(
            "{} {}",
            "Ignored verdicts for unknown steps:".yellow(),
            report.ignored.join(", ")
        );
    }
}

fn print_feedback(feedback: &CodeFeedback) {
    if feedback.correct {
        println!("{}", "Code looks correct".green().bold());
    } else {
        println!("{}", "Code needs work".red().bold());
    }
    if !feedback.feedback.is_empty() {
        println!("\n{}", feedback.feedback);
    }
}

fn print_layout(boxes: &[NodeBox]) {
    if boxes.is_empty() {
        println!("  Empty tree");
        return;
    }

    for node in boxes {
        let branch = node
            .branch
            .map(|b| format!(" branch={:.1}..{:.1}", b.start, b.end))
            .unwrap_or_default();
        println!(
            "{:<10} {:<24} x={:<8.1} y={:<8.1} w={:<6.1} h={:<6.1}{}{}",
            path_label(&node.path),
            node.id,
            node.rect.x,
            node.rect.y,
            node.rect.width,
            node.rect.height,
            branch,
            if node.deleting { " (deleting)" } else { "" }
        );
    }
}
