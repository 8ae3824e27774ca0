use lazy_static::lazy_static;
use std::collections::HashMap;

lazy_static! {
    /// Symbolic genome names and their FASTA location below the iGenomes root.
    pub static ref GENOME_FASTA: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("GRCh37", "Homo_sapiens/Ensembl/GRCh37/Sequence/WholeGenomeFasta/genome.fa");
        m.insert("GRCh38", "Homo_sapiens/NCBI/GRCh38/Sequence/WholeGenomeFasta/genome.fa");
        m.insert("hg19", "Homo_sapiens/UCSC/hg19/Sequence/WholeGenomeFasta/genome.fa");
        m.insert("hg38", "Homo_sapiens/UCSC/hg38/Sequence/WholeGenomeFasta/genome.fa");
        m.insert("GRCm38", "Mus_musculus/Ensembl/GRCm38/Sequence/WholeGenomeFasta/genome.fa");
        m.insert("mm10", "Mus_musculus/UCSC/mm10/Sequence/WholeGenomeFasta/genome.fa");
        m.insert("R64-1-1", "Saccharomyces_cerevisiae/Ensembl/R64-1-1/Sequence/WholeGenomeFasta/genome.fa");
        m.insert("WBcel235", "Caenorhabditis_elegans/Ensembl/WBcel235/Sequence/WholeGenomeFasta/genome.fa");
        m.insert("BDGP6", "Drosophila_melanogaster/Ensembl/BDGP6/Sequence/WholeGenomeFasta/genome.fa");
        m.insert("TAIR10", "Arabidopsis_thaliana/Ensembl/TAIR10/Sequence/WholeGenomeFasta/genome.fa");
        m
    };
}

/// Relative FASTA path for a symbolic genome name.
pub fn symbolic_fasta(name: &str) -> Option<&'static str> {
    GENOME_FASTA.get(name).copied()
}
