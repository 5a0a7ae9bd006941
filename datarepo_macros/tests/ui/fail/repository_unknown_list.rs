use datarepo_macros::{Entity, repository};

#[derive(Entity)]
struct User { #[fetch(id)] id: i64, email: String }

// `finderz` is not a known list
#[repository(entity = User, finderz(find_by_email(email: String) -> Vec))]
mod users_repo {}

fn main() {}
