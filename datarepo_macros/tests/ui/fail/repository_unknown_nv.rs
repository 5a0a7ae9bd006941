use datarepo_macros::{Entity, repository};

#[derive(Entity)]
struct User { #[fetch(id)] id: i64, email: String }

// Misspelled NameValue key should trigger the parser's "Unknown attribute" error
#[repository(entity = User, custon = UserRepoImpl)]
mod users_repo {}

fn main() {}
