// prompts.rs

use crate::extract::SubjectTheme;

pub fn extract_theme_prompt(analysis_text: &str) -> String {
    format!(
        "Analyze this university course syllabus and extract the following information:

Return a JSON object with these exact fields:
- \"core_topic\": Main technical focus (e.g., \"Programming Fundamentals\")
- \"key_contents\": List of 3-5 main topics covered
- \"application_domain\": Field where these skills are applied

IMPORTANT:
1. Focus on the most technical aspects
2. Ignore administrative information
3. If no clear contents found, infer from course title and context
4. Ensure the core_topic and key_contents align with the provided syllabus content

Return a JSON object with the following structure:
{{
    \"core_topic\": \"Programming Fundamentals\",
    \"key_contents\": [\"Variables\", \"Control Structures\", \"Functions\", \"Basic Algorithms\"],
    \"application_domain\": \"Software Development\"
}}

The input text is as follows:
{}",
        analysis_text
    )
}

pub fn extract_subject_prompt(subject_title: &str, text: &str) -> String {
    format!(
        "You are an expert academic information extractor. The input text represents the syllabus \
of a SINGLE university subject titled '{title}'. The text may include sections or topics that \
are NOT separate subjects but rather thematic areas within this single subject.

Extract the following information for the subject '{title}':

1. COMPETENCES:
- List 3-5 specific competences the student will acquire
- Focus on technical skills and practical abilities DIRECTLY RELATED to the subject '{title}'
- Only include competences that align with the subject's discipline
- If the syllabus lacks clear competences, infer 3-5 competences based on the subject title and \
contents, but ensure they are specific to the discipline

2. OBJECTIVES:
- List 5-8 specific learning objectives
- Start each with an action verb (Design, Implement, Analyze, etc.)
- Be as technical and specific as possible

3. CONTENTS:
- Extract ALL technical contents in detail
- Organize in a hierarchical structure where each key is a topic name and its value is a list of \
subtopics
- Use the actual topic names from the syllabus as keys
- Include specific technologies, methods, or tools mentioned in the subtopics
- Only include topics explicitly mentioned in the syllabus; do NOT add placeholder topics
- If more than 6 topics are present, select the 6 most relevant based on technical depth

Return a JSON object with the following structure:
{{
    \"{title}\": {{
        \"competences\": [\"list\", \"of\", \"competences\"],
        \"objectives\": [\"list\", \"of\", \"objectives\"],
        \"contents\": {{ \"Topic 1\": [\"subtopics\"], \"Topic 2\": [\"subtopics\"] }}
    }}
}}

STRICT RULES:
- Always use double quotes
- Maintain consistent JSON structure
- Translate non-English content to English
- If a section is missing, include it as empty array/dict
- Never add explanatory text outside the JSON
- The JSON must be valid

The input text is as follows:
{text}",
        title = subject_title,
        text = text
    )
}

pub fn theme_comparator_prompt(theme1: &SubjectTheme, theme2: &SubjectTheme) -> String {
    format!(
        "As an academic expert, compare these two course themes and rate their similarity (0-1):

Theme 1:
- Core Topic: {}
- Key Contents: {}
- Application Domain: {}

Theme 2:
- Core Topic: {}
- Key Contents: {}
- Application Domain: {}

Evaluation criteria:
1. Core topic alignment (e.g., \"Introductory Programming\" vs. \"Introductory Programming\" = \
high, \"Physics\" vs. \"Biology\" = low).
2. Key content overlap (e.g., \"Data Structures\" vs. \"Algorithms\" = high).
3. Application domain overlap (e.g., \"Computer Engineering\" vs. \"Software Development\" = high).

Special rules:
- If core topics are identical or nearly identical, assign a high similarity (0.85-0.95) unless \
other fields differ significantly.
- Penalize heavily if core topics are from different disciplines.

Return ONLY a number between 0 and 1 with two decimal places, where:
0.90-1.00 = Nearly identical themes
0.70-0.89 = Strong technical and contextual overlap
0.50-0.69 = Partial overlap in some components
0.30-0.49 = Weak, superficial similarity
0.00-0.29 = Essentially different or unrelated

Score:",
        theme1.core_topic,
        theme1.key_contents,
        theme1.application_domain,
        theme2.core_topic,
        theme2.key_contents,
        theme2.application_domain
    )
}

pub fn subject_expert_prompt(
    name1: &str,
    competences1: &str,
    objectives1: &str,
    contents1: &str,
    name2: &str,
    competences2: &str,
    objectives2: &str,
    contents2: &str,
    final_score: f32,
) -> String {
    format!(
        "You are an expert in comparing academic programs. Analyze the thematic similarity between \
the following subjects:

Subject 1:
- Name: {name1}
- Competences: {competences1}
- Objectives: {objectives1}
- Contents: {contents1}

Subject 2:
- Name: {name2}
- Competences: {competences2}
- Objectives: {objectives2}
- Contents: {contents2}

Key Instructions:
- Evaluate thematic similarity by balancing contents, objectives, and competences, prioritizing \
contents but considering all three.
- Identify technical and conceptual similarities (e.g., \"Calculate electric fields\" is similar \
to \"Analyze electromagnetic forces\").
- Treat minor variations as equivalent (e.g., \"Programming in C++\" is similar to \
\"Programming in C\").
- List substantial differences as strings describing the distinction. Do not use expressions \
like \"A\" vs. \"B\"; express each difference as a single valid string.
- Exclude generic or non-technical competences.
- If subject names are similar, deeply analyze contents, objectives, and competences to avoid \
assumptions.
- If the similarity score ({score:.2}) seems inconsistent with your analysis, include a brief \
warning explaining the discrepancy.
- For the explanation, provide useful insights into the thematic relationship, using contents \
as the primary basis for comparison.

Return exclusively a JSON object with the following keys:
{{
    \"similitudes_tecnicas\": [\"theme 1\", \"theme 2\"],
    \"diferencias_sustanciales\": [\"Topic X present only in subject 1\"],
    \"advertencias\": [\"brief warning\"],
    \"explicacion\": \"Clear justification in six to seven sentences for the score ({score:.2}).\"
}}

Strict Requirements:
- Return ONLY a valid JSON object with the exact keys: similitudes_tecnicas (list of strings), \
diferencias_sustanciales (list of strings), advertencias (list of strings), explicacion \
(non-empty string).
- ALWAYS output valid JSON. Escape all double quotes inside strings. Ensure complete syntax \
with closing braces and brackets.
- Do not include trailing commas in arrays or objects.
- Do NOT include additional text, comments, or markdown outside the JSON object.
- Use empty lists for similitudes_tecnicas, diferencias_sustanciales, or advertencias if none \
apply.
- If the input is insufficient or unclear, return empty lists and note the issue in advertencias \
and explicacion.",
        name1 = name1,
        competences1 = competences1,
        objectives1 = objectives1,
        contents1 = contents1,
        name2 = name2,
        competences2 = competences2,
        objectives2 = objectives2,
        contents2 = contents2,
        score = final_score
    )
}
