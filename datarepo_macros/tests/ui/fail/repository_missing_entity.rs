use datarepo_macros::repository;

#[repository(finders(find_by_name(name: String) -> Vec))]
mod things_repo {}

fn main() {}
