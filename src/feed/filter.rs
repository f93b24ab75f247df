use super::article::Article;
use crate::util::contains_ignore_case;

/// Narrows an article list to those matching `query`.
///
/// An empty query returns the input unchanged. Otherwise an article is kept
/// when its title, description, or any category contains the query,
/// ignoring case. Relative order is preserved, and filtering a result again
/// with the same query returns it unchanged.
pub fn filter_articles(articles: &[Article], query: &str) -> Vec<Article> {
    if query.is_empty() {
        return articles.to_vec();
    }

    let needle = query.to_lowercase();
    articles
        .iter()
        .filter(|a| matches_query(a, &needle))
        .cloned()
        .collect()
}

fn matches_query(article: &Article, needle_lower: &str) -> bool {
    contains_ignore_case(&article.title, needle_lower)
        || contains_ignore_case(&article.description, needle_lower)
        || article.any_category(|c| contains_ignore_case(c, needle_lower))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn article(title: &str, description: &str, categories: Option<&[&str]>) -> Article {
        Article {
            id: Uuid::new_v4(),
            title: Arc::from(title),
            description: Arc::from(description),
            link: Arc::from(""),
            pub_date: Arc::from(""),
            creator: Arc::from(""),
            categories: categories.map(|cs| cs.iter().map(|c| Arc::from(*c)).collect()),
        }
    }

    fn sample() -> Vec<Article> {
        vec![
            article("Rust 1.80 released", "Release notes", Some(&["Tech"])),
            article("Local elections", "Results are in", Some(&["Politics", "News"])),
            article("Weekend recipes", "Slow-cooked <b>RUST</b>-colored stew", None),
            article("Market update", "Stocks rallied", Some(&["Finance"])),
        ]
    }

    #[test]
    fn test_empty_query_is_identity() {
        let articles = sample();
        assert_eq!(filter_articles(&articles, ""), articles);
    }

    #[test]
    fn test_matches_title_description_and_category() {
        let articles = sample();

        let by_title = filter_articles(&articles, "ELECTIONS");
        assert_eq!(by_title, vec![articles[1].clone()]);

        let by_description = filter_articles(&articles, "rallied");
        assert_eq!(by_description, vec![articles[3].clone()]);

        let by_category = filter_articles(&articles, "news");
        assert_eq!(by_category, vec![articles[1].clone()]);
    }

    #[test]
    fn test_order_preserved() {
        let articles = sample();
        let hits = filter_articles(&articles, "rust");
        assert_eq!(hits, vec![articles[0].clone(), articles[2].clone()]);
    }

    #[test]
    fn test_no_match_returns_empty() {
        assert!(filter_articles(&sample(), "quantum").is_empty());
    }

    #[test]
    fn test_articles_without_categories_do_not_match_on_category() {
        let articles = vec![article("A", "B", None)];
        assert!(filter_articles(&articles, "tech").is_empty());
    }

    #[test]
    fn test_unicode_case_folding() {
        let articles = vec![article("Ärger im Büro", "", None)];
        assert_eq!(filter_articles(&articles, "ärger").len(), 1);
        assert_eq!(filter_articles(&articles, "BÜRO").len(), 1);
    }

    proptest! {
        #[test]
        fn prop_filter_is_idempotent(
            titles in proptest::collection::vec("[a-cA-C ]{0,8}", 0..12),
            query in "[a-cA-C]{0,3}",
        ) {
            let articles: Vec<Article> = titles.iter().map(|t| article(t, "", None)).collect();
            let once = filter_articles(&articles, &query);
            let twice = filter_articles(&once, &query);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_filter_returns_subsequence(
            titles in proptest::collection::vec("[a-c]{0,6}", 0..12),
            query in "[a-c]{1,2}",
        ) {
            let articles: Vec<Article> = titles.iter().map(|t| article(t, "", None)).collect();
            let hits = filter_articles(&articles, &query);
            let mut rest = articles.iter();
            for hit in &hits {
                prop_assert!(rest.any(|a| a.id == hit.id));
            }
        }
    }
}
