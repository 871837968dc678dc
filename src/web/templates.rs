use minijinja::{context, Environment};
use tracing::error;

use crate::agent::state::{Role, UserContext};

pub const EXIT_WORDS: &[&str] = &["quit", "exit", "bye"];

pub fn init_templates() -> Result<Environment<'static>, minijinja::Error> {
    let mut env = Environment::new();

    env.add_template("welcome.txt", include_str!("../../templates/welcome.txt"))?;
    env.add_template("help.txt", include_str!("../../templates/help.txt"))?;

    Ok(env)
}

fn example_questions(role: Role) -> &'static [&'static str] {
    match role {
        Role::Admin => &[
            "How many total properties are in the database?",
            "What is the most profitable property?",
            "List all properties in Arizona",
        ],
        Role::Owner => &[
            "How many properties do I have?",
            "What is my most profitable property?",
            "What's my average rent?",
        ],
        Role::Viewer => &[
            "How many properties are in the database?",
            "What's the average rent?",
            "How many properties in Texas?",
        ],
    }
}

fn capabilities(role: Role) -> (&'static [&'static str], &'static [&'static str]) {
    match role {
        Role::Admin => (
            &[
                "View all properties across all owners",
                "Get detailed property information",
                "Query any owner's data (LLC1-LLC5)",
                "Access financial data",
            ],
            &[],
        ),
        Role::Owner => (
            &[
                "View your properties and details",
                "Get counts and statistics for your portfolio",
                "Query rent and profitability",
            ],
            &["Cannot view other owners' properties"],
        ),
        Role::Viewer => (
            &[
                "View property counts and totals",
                "Get average statistics",
                "Query aggregate data by location",
            ],
            &["Cannot view specific addresses", "Cannot view owner details"],
        ),
    }
}

pub fn render_welcome(env: &Environment, user: &UserContext) -> String {
    let (allowed, denied) = capabilities(user.role);
    render(
        env,
        "welcome.txt",
        context! {
            role => user.role.to_string(),
            name => user.display_name(),
            allowed => allowed,
            denied => denied,
            examples => example_questions(user.role),
        },
    )
}

pub fn render_help(env: &Environment, role: Role) -> String {
    render(
        env,
        "help.txt",
        context! {
            examples => example_questions(role),
            exit_words => EXIT_WORDS,
        },
    )
}

fn render(env: &Environment, template_name: &str, ctx: minijinja::value::Value) -> String {
    match env.get_template(template_name).and_then(|tmpl| tmpl.render(ctx)) {
        Ok(result) => result,
        Err(e) => {
            error!("Template render error in {}: {}", template_name, e);
            format!("Template error: {}", e)
        }
    }
}
