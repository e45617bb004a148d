//! Research prompt construction
//!
//! Turns the user's research parameters into the instruction text handed to
//! the document-generation workflow.

use crate::models::ResearchParameters;
use chrono::NaiveDate;

/// Build the task prompt for a research job.
///
/// `today` anchors web searches so the workflow looks for the most recent data.
pub fn build_research_prompt(params: &ResearchParameters, today: NaiveDate) -> String {
    let modifiers = &params.modifiers;

    format!(
        "Utilize Web Search to develop a singular document utilizing the following structure as the guide to provide users with a valuable research document: \n\
         Analysis Type: {capability}\n\
         Framework: {framework}\n\
         \n\
         Utilize this context to gain additional insight into your research topic:\n\
         {context}\n\
         \n\
         The Research Parameters you must follow for this document are:\n\
         - Scope: {scope}\n\
         - Overview Detail: {overview}\n\
         - Analytical Rigor: {rigor}\n\
         - Perspective: {perspective}\n\
         \n\
         All web searches must acknowledge that the current date is {date} when searching for the most recent data. \
         Search for the most recent data unless otherwise specified. Always capture the most recent reliable data. \
         The final output must be a document uploaded to the content object library. \
         Please produce a singular document for this research.",
        capability = params.capability,
        framework = params.framework,
        context = params.context.trim(),
        scope = modifiers.scope,
        overview = modifiers.overview_details,
        rigor = modifiers.analytical_rigor,
        perspective = modifiers.perspective,
        date = today.format("%m.%d.%Y"),
    )
    .trim()
    .to_string()
}
